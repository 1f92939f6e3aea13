//! Configuration loading from `~/.agora/config.toml` with defaults.

use agora_types::NodeConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file yields [`NodeConfig::default`];
/// the problem is logged, never returned.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), name = %config.name, "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    agora_home().join("config.toml")
}

/// Get the default Agora home directory.
pub fn agora_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agora")
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::Credentials;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
name = "relay"
listen_port = 7400
peers = ["10.0.0.2:7400"]
compression = "none"

[master_credentials]
username = "admin"
password = "hunter2"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.name, "relay");
        assert_eq!(config.listen_port, Some(7400));
        assert_eq!(config.peers, vec!["10.0.0.2:7400".to_string()]);
        assert_eq!(config.compression, "none");
        assert_eq!(
            config.master_credentials,
            Some(Credentials::new("admin", "hunter2"))
        );
        assert!(config.secure);
        assert_eq!(config.max_hops, NodeConfig::default().max_hops);
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "name = [unterminated").unwrap();
        assert_eq!(load_config(Some(&path)), NodeConfig::default());
    }

    #[test]
    fn test_default_path_under_home() {
        let path = default_config_path();
        assert!(path.ends_with(".agora/config.toml"));
    }
}
