//! Agora wire protocol: agent-to-agent links over TCP.
//!
//! ## Architecture
//!
//! - **Packet**: a numeric [`PacketCode`] plus a body, framed as
//!   `@` + base64(encrypt(compress(flat-kv))) + `$`
//! - **State**: the per-link handshake state machine, a pure transition function
//! - **Connection**: one TCP stream, its negotiated pipeline and its read loop
//! - **SocketAgent**: accepts and opens connections on behalf of a node
//! - **AgentHandle**: trait through which links call back into the node

pub mod codec;
pub mod compression;
pub mod connection;
pub mod encryption;
pub mod error;
pub mod packet;
pub mod socket;
pub mod state;

pub use connection::{Connection, ConnectionInfo, ConnectionStatus, Direction};
pub use error::{WireError, WireResult};
pub use packet::{Packet, PacketCode};
pub use socket::{AgentHandle, CredentialsHandler, NetworkEvent, SocketAgent, SocketConfig};
pub use state::State;
