//! Routing error types.

use thiserror::Error;

/// Errors raised synchronously to a caller that misused a route or asked
/// the router for something impossible.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The name already appears on the route; extending would create a cycle.
    #[error("Duplicate agent name on route: {0}")]
    DuplicateAgentName(String),

    /// A route was requested from an agent to itself.
    #[error("Cannot route to self: {0}")]
    RouteToSelf(String),

    /// There are no further hops on the route.
    #[error("End of route")]
    EndOfRoute,

    /// Discovery finished without finding the destination.
    #[error("No route to {0}")]
    NoRoute(String),

    /// The name is empty or contains reserved characters.
    #[error("Invalid agent name: {0:?}")]
    InvalidAgentName(String),

    /// A serialized route or message could not be parsed.
    #[error("Malformed encoding: {0}")]
    Malformed(String),
}

/// Alias for Result with RoutingError.
pub type RoutingResult<T> = Result<T, RoutingError>;
