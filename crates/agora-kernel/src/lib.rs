//! Core kernel for Agora nodes.
//!
//! An [`Agent`] is a named node. It keeps a [`RoutingTable`] of known routes,
//! discovers unknown destinations with a [`RoutingWorker`] flood, forwards
//! messages hop by hop to in-process peers or over its socket links, and
//! repairs routing state with an [`Undertaker`] crawl whenever a link goes
//! away.

pub mod agent;
pub mod config;
pub mod error;
pub mod routing;
pub mod undertaker;

pub use agent::{Agent, MessageListener};
pub use error::{AgentError, AgentResult};
pub use routing::{RoutingTable, RoutingWorker};
pub use undertaker::{CrawlReport, Undertaker};
