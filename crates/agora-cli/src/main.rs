//! Agora CLI: run a node of the overlay from the terminal.
//!
//! `agora run` boots an agent with a socket, then reads commands from stdin:
//! `<agent>: <text>` sends a message, slash commands inspect the node.

mod cli;

use crate::cli::{Cli, Commands};
use agora_kernel::config::{default_config_path, load_config};
use agora_kernel::Agent;
use agora_types::{Message, NodeConfig};
use agora_wire::NetworkEvent;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Init { force } => cmd_init(cli.config.as_deref(), force),
        Commands::Run {
            name,
            port,
            connect,
            compression,
            insecure,
        } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(name) = name {
                config.name = name;
            }
            if port.is_some() {
                config.listen_port = port;
            }
            config.peers.extend(connect);
            if let Some(compression) = compression {
                config.compression = compression;
            }
            if insecure {
                config.secure = false;
            }

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create Tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(cmd_run(config)) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}

fn cmd_init(path: Option<&Path>, force: bool) {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        std::process::exit(1);
    }
    let contents = match toml::to_string_pretty(&NodeConfig::default()) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create {}: {e}", dir.display());
            std::process::exit(1);
        }
    }
    match std::fs::write(&path, contents) {
        Ok(()) => println!("Wrote {}", path.display()),
        Err(e) => {
            eprintln!("Failed to write {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

async fn cmd_run(config: NodeConfig) -> Result<(), agora_kernel::AgentError> {
    let agent = Agent::boot(&config).await?;
    agent.add_listener(Arc::new(|m: &Message| {
        println!("[{}] {}", m.originator(), m.data());
    }));
    if let Some(socket) = agent.socket() {
        spawn_event_printer(socket.subscribe());
    }
    println!("Agent '{}' running. Type /help for commands.", agent.name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("stdin: {e}");
                break;
            }
        };
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{}", cli::AFTER_HELP),
            Input::Peers => println!("{}", agent.neighbors().join(", ")),
            Input::Routes => {
                for (destination, route) in agent.routing_table().entries() {
                    println!("{destination:>16}  {route}");
                }
            }
            Input::Links => {
                for link in agent.socket().map(|s| s.connections()).unwrap_or_default() {
                    println!(
                        "#{} {} {:?} {} {:?} {}/{} rtt={:?}",
                        link.id,
                        link.address,
                        link.direction,
                        link.remote_name.as_deref().unwrap_or("?"),
                        link.status,
                        link.compression,
                        link.encryption,
                        link.last_rtt,
                    );
                }
            }
            Input::Connect(address) => match address.rsplit_once(':') {
                Some((host, port)) => match (agent.socket(), port.parse::<u16>()) {
                    (Some(socket), Ok(port)) => socket.add_connection(host, port),
                    _ => eprintln!("usage: /connect <host:port>"),
                },
                None => eprintln!("usage: /connect <host:port>"),
            },
            Input::Send { to, text } => match agent.send(&to, &text).await {
                Ok(message) => println!("-> {} via {}", to, message.route()),
                Err(e) => eprintln!("send to {to} failed: {e}"),
            },
            Input::Invalid(reason) => eprintln!("{reason}"),
        }
    }

    agent.shutdown().await;
    Ok(())
}

fn spawn_event_printer(mut events: tokio::sync::broadcast::Receiver<NetworkEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NetworkEvent::Authenticated { peer, .. } => println!("* linked to {peer}"),
                NetworkEvent::Closed { peer: Some(peer), reason, .. } => {
                    println!("* link to {peer} closed ({reason})")
                }
                NetworkEvent::ConnectionFailed { address, reason } => {
                    println!("* could not connect to {address}: {reason}")
                }
                NetworkEvent::AdvertisingStarted { address } => println!("* listening on {address}"),
                NetworkEvent::AdvertisingFailed { port, reason } => {
                    println!("* cannot listen on port {port}: {reason}")
                }
                _ => {}
            }
        }
    });
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Quit,
    Help,
    Peers,
    Routes,
    Links,
    Connect(String),
    Send { to: String, text: String },
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if let Some(command) = line.strip_prefix('/') {
        let mut parts = command.split_whitespace();
        return match (parts.next(), parts.next()) {
            (Some("quit" | "exit"), _) => Input::Quit,
            (Some("help"), _) => Input::Help,
            (Some("peers"), _) => Input::Peers,
            (Some("routes"), _) => Input::Routes,
            (Some("links"), _) => Input::Links,
            (Some("connect"), Some(address)) => Input::Connect(address.to_string()),
            (Some("connect"), None) => Input::Invalid("usage: /connect <host:port>".into()),
            (Some(other), _) => Input::Invalid(format!("unknown command /{other}")),
            (None, _) => Input::Invalid("empty command".into()),
        };
    }
    match line.split_once(':') {
        Some((to, text)) if !to.trim().is_empty() => Input::Send {
            to: to.trim().to_string(),
            text: text.trim_start().to_string(),
        },
        _ => Input::Invalid("expected `<agent>: <text>`".into()),
    }
}
