//! Routes: ordered hop paths from originator to recipient.
//!
//! A [`Route`] never names the same agent twice. Every mutator that could
//! introduce a repeat fails with [`RoutingError::DuplicateAgentName`], so a
//! route that exists is always acyclic.

use crate::error::{RoutingError, RoutingResult};
use crate::name;
use std::fmt;

/// Separator between names in the serialized form. Reserved in agent names.
const SEPARATOR: char = ',';

/// An ordered, cycle-free sequence of agent names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    hops: Vec<String>,
}

impl Route {
    /// A route containing only its originator.
    pub fn new(originator: &str) -> RoutingResult<Self> {
        Ok(Self {
            hops: vec![name::validate(originator)?],
        })
    }

    /// Build a route from a sequence of names, rejecting repeats.
    pub fn from_hops<I, S>(hops: I) -> RoutingResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut route = Self { hops: Vec::new() };
        for hop in hops {
            route.append(hop.as_ref())?;
        }
        Ok(route)
    }

    /// Append a name to the end of the route.
    pub fn append(&mut self, name: &str) -> RoutingResult<()> {
        let name = name::validate(name)?;
        if self.contains(&name) {
            return Err(RoutingError::DuplicateAgentName(name));
        }
        self.hops.push(name);
        Ok(())
    }

    /// A copy of this route with `name` appended.
    pub fn extended(&self, name: &str) -> RoutingResult<Self> {
        let mut route = self.clone();
        route.append(name)?;
        Ok(route)
    }

    /// Join `tail` onto the end of this route.
    ///
    /// If `tail` begins with this route's last hop the shared name is
    /// written once.
    pub fn join(&self, tail: &Route) -> RoutingResult<Self> {
        let mut route = self.clone();
        let skip = usize::from(
            route.recipient().is_some() && route.recipient() == tail.originator(),
        );
        for hop in tail.hops.iter().skip(skip) {
            route.append(hop)?;
        }
        Ok(route)
    }

    /// Remove and return the first remaining hop.
    pub fn pop_next_hop(&mut self) -> RoutingResult<String> {
        if self.hops.is_empty() {
            return Err(RoutingError::EndOfRoute);
        }
        Ok(self.hops.remove(0))
    }

    /// The hop that follows `name` on this route.
    pub fn next_hop_after(&self, name: &str) -> RoutingResult<String> {
        let mut remaining = self.clone();
        while remaining.pop_next_hop()? != name {}
        remaining.pop_next_hop()
    }

    /// The part of the route starting at `name`, if `name` is on it.
    pub fn suffix_from(&self, name: &str) -> Option<Route> {
        let start = self.position(name)?;
        Some(Self {
            hops: self.hops[start..].to_vec(),
        })
    }

    /// The part of the route ending at `name`, reversed so `name` comes first.
    pub fn reverse_from(&self, name: &str) -> Option<Route> {
        let end = self.position(name)?;
        Some(Self {
            hops: self.hops[..=end].iter().rev().cloned().collect(),
        })
    }

    pub fn originator(&self) -> Option<&str> {
        self.hops.first().map(String::as_str)
    }

    pub fn recipient(&self) -> Option<&str> {
        self.hops.last().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hops.iter().any(|h| h == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.hops.iter().position(|h| h == name)
    }

    /// Number of names on the route.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Number of links traversed (one less than the number of names).
    pub fn hop_count(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn hops(&self) -> &[String] {
        &self.hops
    }

    /// Serialize as a comma-separated name list.
    pub fn serialize(&self) -> String {
        self.hops.join(&SEPARATOR.to_string())
    }

    /// Parse the comma-separated form, enforcing name validity and acyclicity.
    pub fn parse(input: &str) -> RoutingResult<Self> {
        if input.is_empty() {
            return Ok(Self { hops: Vec::new() });
        }
        Self::from_hops(input.split(SEPARATOR))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hops.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hops: &[&str]) -> Route {
        Route::from_hops(hops).unwrap()
    }

    #[test]
    fn test_append_rejects_cycle() {
        let mut r = route(&["a", "b", "c"]);
        assert_eq!(
            r.append("b"),
            Err(RoutingError::DuplicateAgentName("b".to_string()))
        );
        assert_eq!(r.len(), 3);
        assert_eq!(
            Route::from_hops(["x", "y", "x"]),
            Err(RoutingError::DuplicateAgentName("x".to_string()))
        );
    }

    #[test]
    fn test_append_rejects_invalid_name() {
        let mut r = route(&["a"]);
        assert!(matches!(
            r.append("b,c"),
            Err(RoutingError::InvalidAgentName(_))
        ));
    }

    #[test]
    fn test_pop_until_exhausted() {
        let mut r = route(&["a", "b"]);
        assert_eq!(r.pop_next_hop().unwrap(), "a");
        assert_eq!(r.pop_next_hop().unwrap(), "b");
        assert_eq!(r.pop_next_hop(), Err(RoutingError::EndOfRoute));
    }

    #[test]
    fn test_next_hop_after() {
        let r = route(&["a", "b", "c"]);
        assert_eq!(r.next_hop_after("a").unwrap(), "b");
        assert_eq!(r.next_hop_after("b").unwrap(), "c");
        assert_eq!(r.next_hop_after("c"), Err(RoutingError::EndOfRoute));
        assert_eq!(r.next_hop_after("zed"), Err(RoutingError::EndOfRoute));
    }

    #[test]
    fn test_join_shares_boundary_name() {
        let head = route(&["a", "b"]);
        let tail = route(&["b", "c", "d"]);
        assert_eq!(head.join(&tail).unwrap(), route(&["a", "b", "c", "d"]));

        let disjoint = route(&["c", "d"]);
        assert_eq!(head.join(&disjoint).unwrap(), route(&["a", "b", "c", "d"]));

        let looping = route(&["b", "c", "a"]);
        assert!(matches!(
            head.join(&looping),
            Err(RoutingError::DuplicateAgentName(_))
        ));
    }

    #[test]
    fn test_suffix_and_reverse() {
        let r = route(&["a", "b", "c", "d"]);
        assert_eq!(r.suffix_from("b").unwrap(), route(&["b", "c", "d"]));
        assert_eq!(r.reverse_from("c").unwrap(), route(&["c", "b", "a"]));
        assert!(r.suffix_from("q").is_none());
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        for hops in [vec!["solo"], vec!["a", "b", "c"], vec!["n-1", "n_2", "n.3"]] {
            let r = route(&hops);
            assert_eq!(Route::parse(&r.serialize()).unwrap(), r);
        }
        assert!(Route::parse("").unwrap().is_empty());
        assert!(matches!(
            Route::parse("a,b,a"),
            Err(RoutingError::DuplicateAgentName(_))
        ));
    }

    #[test]
    fn test_accessors() {
        let r = route(&["a", "b", "c"]);
        assert_eq!(r.originator(), Some("a"));
        assert_eq!(r.recipient(), Some("c"));
        assert_eq!(r.hop_count(), 2);
        assert_eq!(r.to_string(), "a -> b -> c");
    }
}
