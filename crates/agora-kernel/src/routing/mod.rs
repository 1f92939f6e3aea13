//! Route bookkeeping and discovery.

mod table;
mod worker;

pub use table::RoutingTable;
pub use worker::RoutingWorker;
