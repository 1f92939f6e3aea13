//! Message envelope.
//!
//! A [`Message`] pairs a payload with the [`Route`] it travels along. The
//! serialized form is a flat key-value string with fields `id`, `route` and
//! `data`, in that order.

use crate::error::{RoutingError, RoutingResult};
use crate::flatkv::FlatKv;
use crate::route::Route;

/// Generate a fresh message identifier.
///
/// Random v4 UUIDs are unique enough across nodes without any coordination.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An immutable routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    route: Route,
    data: String,
}

impl Message {
    /// Create a message with a fresh id. The route must name at least the
    /// originator.
    pub fn new(route: Route, data: impl Into<String>) -> RoutingResult<Self> {
        Self::with_id(new_message_id(), route, data)
    }

    /// Create a message with a caller-supplied id.
    pub fn with_id(
        id: impl Into<String>,
        route: Route,
        data: impl Into<String>,
    ) -> RoutingResult<Self> {
        if route.is_empty() {
            return Err(RoutingError::EndOfRoute);
        }
        Ok(Self {
            id: id.into(),
            route,
            data: data.into(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// The first name on the route.
    pub fn originator(&self) -> &str {
        self.route.originator().unwrap_or_default()
    }

    /// The last name on the route.
    pub fn recipient(&self) -> &str {
        self.route.recipient().unwrap_or_default()
    }

    pub fn to_flat(&self) -> FlatKv {
        FlatKv::new()
            .with("id", self.id.as_str())
            .with("route", self.route.serialize())
            .with("data", self.data.as_str())
    }

    pub fn from_flat(kv: &FlatKv) -> RoutingResult<Self> {
        let field = |key: &str| {
            kv.require(key)
                .map_err(|e| RoutingError::Malformed(e.to_string()))
        };
        let route = Route::parse(field("route")?)?;
        Self::with_id(field("id")?, route, field("data")?)
    }

    /// Serialize to the flat key-value wire form.
    pub fn serialize(&self) -> String {
        self.to_flat().encode()
    }

    /// Parse the flat key-value wire form.
    pub fn deserialize(input: &str) -> RoutingResult<Self> {
        Self::from_flat(&FlatKv::decode(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hops: &[&str]) -> Route {
        Route::from_hops(hops).unwrap()
    }

    #[test]
    fn test_derived_accessors() {
        let msg = Message::new(route(&["alice", "bob", "carol"]), "hi").unwrap();
        assert_eq!(msg.originator(), "alice");
        assert_eq!(msg.recipient(), "carol");
        assert_eq!(msg.data(), "hi");
    }

    #[test]
    fn test_ids_are_unique() {
        let r = route(&["a", "b"]);
        let a = Message::new(r.clone(), "x").unwrap();
        let b = Message::new(r, "x").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_roundtrip_payloads() {
        let payloads = ["", "plain", "k=v&x=y", "multi\nline\ttext", "emoji 🚀 @$%"];
        for data in payloads {
            let msg = Message::new(route(&["a", "b", "c"]), data).unwrap();
            let decoded = Message::deserialize(&msg.serialize()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_field_order() {
        let msg = Message::with_id("m1", route(&["a", "b"]), "d").unwrap();
        assert_eq!(msg.serialize(), "id=m1&route=a%2Cb&data=d");
    }

    #[test]
    fn test_rejects_empty_route() {
        assert_eq!(
            Message::new(Route::parse("").unwrap(), "x"),
            Err(RoutingError::EndOfRoute)
        );
    }

    #[test]
    fn test_deserialize_missing_field() {
        let err = Message::deserialize("id=1&route=a%2Cb").unwrap_err();
        assert!(matches!(err, RoutingError::Malformed(ref m) if m.contains("data")));
    }

    #[test]
    fn test_deserialize_cyclic_route() {
        let err = Message::deserialize("id=1&route=a%2Cb%2Ca&data=").unwrap_err();
        assert_eq!(err, RoutingError::DuplicateAgentName("a".to_string()));
    }
}
