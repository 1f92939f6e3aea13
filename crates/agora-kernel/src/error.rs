//! Kernel-specific error types.

use agora_types::RoutingError;
use agora_wire::WireError;
use thiserror::Error;

/// Agent error type wrapping routing and wire errors with node context.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A wrapped RoutingError.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A wrapped WireError.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Discovery found no route to the destination.
    #[error("No route to {0}")]
    NoRoute(String),

    /// The next hop is neither an in-process peer nor a connected link.
    #[error("{0} is not a neighbor")]
    UnknownNeighbor(String),
}

/// Alias for agent results.
pub type AgentResult<T> = Result<T, AgentError>;
