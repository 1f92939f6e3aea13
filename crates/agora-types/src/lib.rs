//! Core types for the Agora overlay messaging network.
//!
//! This crate defines the data structures shared by the wire protocol and the
//! node kernel: agent names, routes, messages, the flat key-value encoding
//! they serialize to, and node configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod flatkv;
pub mod message;
pub mod name;
pub mod route;

pub use config::{Credentials, NodeConfig};
pub use error::{RoutingError, RoutingResult};
pub use flatkv::FlatKv;
pub use message::Message;
pub use route::Route;
