//! Node configuration types.
//!
//! Deserialized from `config.toml`; every field has a default so a partial
//! file is always valid.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of simultaneous connections a node will hold.
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Default bound on the length of a discovery flood.
pub const DEFAULT_MAX_HOPS: usize = 8;

/// Default time a discovery query may take before it is abandoned.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5_000;

/// A username/password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This agent's name on the network.
    pub name: String,
    /// Port to advertise on at startup. `None` keeps the node outbound-only.
    pub listen_port: Option<u16>,
    /// Inbound connections beyond this count are refused with TOO_MANY_PEERS.
    pub max_connections: usize,
    /// Compression announced to inbound peers (`none` or `deflate`).
    pub compression: String,
    /// Whether inbound handshakes negotiate link encryption.
    pub secure: bool,
    /// Credentials inbound peers must present. `None` admits everyone.
    pub master_credentials: Option<Credentials>,
    /// Credentials presented when a remote node demands them.
    pub credentials: Option<Credentials>,
    /// `host:port` addresses to connect to at startup.
    pub peers: Vec<String>,
    /// Longest route a discovery flood will explore.
    pub max_hops: usize,
    /// Per-query discovery timeout in milliseconds.
    pub discovery_timeout_ms: u64,
    /// Interval between latency probes on authenticated links.
    pub poke_interval_secs: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "agora-node".to_string(),
            listen_port: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            compression: "deflate".to_string(),
            secure: true,
            master_credentials: None,
            credentials: None,
            peers: Vec::new(),
            max_hops: DEFAULT_MAX_HOPS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            poke_interval_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            name = "alpha"
            listen_port = 7700

            [master_credentials]
            username = "admin"
            password = "hunter2"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "alpha");
        assert_eq!(config.listen_port, Some(7700));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.compression, "deflate");
        assert!(config.secure);
        assert_eq!(
            config.master_credentials,
            Some(Credentials::new("admin", "hunter2"))
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }
}
