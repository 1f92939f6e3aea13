//! Routing table: destination name to best-known route.
//!
//! Every operation runs under one table-wide lock, so readers never observe
//! a half-applied add or invalidation. Routes handed out are clones.

use agora_types::Route;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Thread-safe map of destination to route.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<String, Route>>,
}

impl RoutingTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_route(&self, destination: &str) -> bool {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.contains_key(destination)
    }

    /// Install `route` for `destination` unless an equal or shorter one is
    /// already known. Returns whether the table changed.
    ///
    /// The route must end at `destination`.
    pub fn add_route(&self, destination: &str, route: Route) -> bool {
        if route.recipient() != Some(destination) {
            debug!(%destination, %route, "Ignoring route that ends elsewhere");
            return false;
        }
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes.get(destination) {
            Some(existing) if existing.len() <= route.len() => false,
            _ => {
                debug!(%destination, %route, "Route installed");
                routes.insert(destination.to_string(), route);
                true
            }
        }
    }

    /// A copy of the route to `destination`.
    pub fn get_route(&self, destination: &str) -> Option<Route> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.get(destination).cloned()
    }

    /// Drop the entry for `name` and every route passing through it.
    /// Returns the number of entries removed.
    pub fn invalidate_agent(&self, name: &str) -> usize {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let before = routes.len();
        routes.retain(|destination, route| destination != name && !route.contains(name));
        before - routes.len()
    }

    pub fn clear(&self) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, sorted by destination.
    pub fn entries(&self) -> Vec<(String, Route)> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(String, Route)> = routes
            .iter()
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hops: &[&str]) -> Route {
        Route::from_hops(hops).unwrap()
    }

    #[test]
    fn test_shorter_route_wins() {
        let table = RoutingTable::new();
        assert!(table.add_route("d", route(&["a", "b", "c", "d"])));
        assert!(!table.add_route("d", route(&["a", "x", "y", "d"])));
        assert!(!table.add_route("d", route(&["a", "b", "c", "e", "d"])));
        assert_eq!(table.get_route("d").unwrap().len(), 4);
        assert_eq!(table.get_route("d").unwrap().hops()[1], "b");

        assert!(table.add_route("d", route(&["a", "z", "d"])));
        assert_eq!(table.get_route("d").unwrap(), route(&["a", "z", "d"]));
    }

    #[test]
    fn test_add_is_idempotent() {
        let table = RoutingTable::new();
        assert!(table.add_route("c", route(&["a", "b", "c"])));
        assert!(!table.add_route("c", route(&["a", "b", "c"])));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_route_must_end_at_destination() {
        let table = RoutingTable::new();
        assert!(!table.add_route("c", route(&["a", "b"])));
        assert!(!table.has_route("c"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_returns_a_copy() {
        let table = RoutingTable::new();
        table.add_route("c", route(&["a", "b", "c"]));
        let mut copy = table.get_route("c").unwrap();
        copy.pop_next_hop().unwrap();
        assert_eq!(table.get_route("c").unwrap().len(), 3);
    }

    #[test]
    fn test_invalidate_removes_key_and_paths_through() {
        let table = RoutingTable::new();
        table.add_route("b", route(&["a", "b"]));
        table.add_route("c", route(&["a", "b", "c"]));
        table.add_route("d", route(&["a", "x", "d"]));
        table.add_route("e", route(&["a", "x", "b", "e"]));

        assert_eq!(table.invalidate_agent("b"), 3);
        assert!(!table.has_route("b"));
        assert!(!table.has_route("c"));
        assert!(!table.has_route("e"));
        assert!(table.has_route("d"));
        assert!(table
            .entries()
            .iter()
            .all(|(dest, r)| dest != "b" && !r.contains("b")));

        assert_eq!(table.invalidate_agent("nobody"), 0);
        table.clear();
        assert!(table.is_empty());
    }
}
