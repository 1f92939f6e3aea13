//! Errors from the wire protocol layer.

use agora_types::RoutingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stream corrupted: {0}")]
    StreamCorrupted(String),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out")]
    Timeout,
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Encryption error: {0}")]
    Encryption(String),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub type WireResult<T> = Result<T, WireError>;
