//! Clap CLI definitions for Agora.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  agora init                         Write a default ~/.agora/config.toml
  agora run --name alice --port 7400 Start a node that accepts links
  agora run --name bob --connect 127.0.0.1:7400

While a node runs, type `<agent>: <text>` to send a message.
Other commands: /peers, /routes, /links, /connect <host:port>, /quit";

/// Agora: overlay messaging between named agents.
#[derive(Parser)]
#[command(name = "agora", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Start a node and read messages to send from stdin.
    Run {
        /// Agent name (overrides the config file).
        #[arg(long)]
        name: Option<String>,
        /// Port to accept links on (overrides the config file).
        #[arg(long, short = 'p')]
        port: Option<u16>,
        /// Peer to connect to at startup, as host:port. Repeatable.
        #[arg(long = "connect", short = 'c')]
        connect: Vec<String>,
        /// Compression to announce to inbound peers.
        #[arg(long, value_parser = ["none", "deflate"])]
        compression: Option<String>,
        /// Do not negotiate link encryption on inbound links.
        #[arg(long)]
        insecure: bool,
    },
}
