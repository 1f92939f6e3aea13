//! Flat key-value encoding.
//!
//! An ordered list of `key=value` pairs joined by `&`, with reserved
//! characters percent-escaped (`application/x-www-form-urlencoded`). Used for
//! handshake parameter bodies, serialized routes and messages, and the packet
//! envelope itself.

use thiserror::Error;
use url::form_urlencoded;

/// A required field was absent from a decoded flat key-value string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Missing field: {0}")]
pub struct MissingField(pub String);

/// An ordered collection of string pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatKv {
    pairs: Vec<(String, String)>,
}

impl FlatKv {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Append a pair. Keys may repeat; lookups return the first match.
    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.pairs.push((key.to_string(), value.into()));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value stored under `key`, or an error naming the key.
    pub fn require(&self, key: &str) -> Result<&str, MissingField> {
        self.get(key).ok_or_else(|| MissingField(key.to_string()))
    }

    /// Iterate over pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Encode to the `key=value&key=value` form.
    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.pairs {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }

    /// Decode from the `key=value&key=value` form.
    ///
    /// Decoding is lenient: a segment without `=` decodes to a key with an
    /// empty value, and empty segments are skipped.
    pub fn decode(input: &str) -> Self {
        let pairs = form_urlencoded::parse(input.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for FlatKv {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}
