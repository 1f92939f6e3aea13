//! Agent name validation.
//!
//! Names travel inside serialized routes and handshake bodies, so the
//! characters used as separators by those encodings are reserved.

use crate::error::{RoutingError, RoutingResult};

/// Maximum length of an agent name in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Characters an agent name may not contain.
pub const RESERVED_CHARS: &[char] = &['@', '$', '&', '=', '%', ',', ':'];

/// Returns true if `name` is usable as an agent name.
pub fn is_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name
            .chars()
            .any(|c| RESERVED_CHARS.contains(&c) || c.is_whitespace() || c.is_control())
}

/// Validate an agent name, returning it owned on success.
pub fn validate(name: &str) -> RoutingResult<String> {
    if is_valid(name) {
        Ok(name.to_string())
    } else {
        Err(RoutingError::InvalidAgentName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid("alice"));
        assert!(is_valid("node-7.eu_west"));
        assert!(is_valid("ünïcødé"));
    }

    #[test]
    fn test_rejects_empty_and_reserved() {
        assert!(!is_valid(""));
        for bad in ["a,b", "a@b", "a$b", "a&b", "a=b", "a%b", "a:b", "a b", "a\nb"] {
            assert!(!is_valid(bad), "{bad:?} should be invalid");
        }
    }

    #[test]
    fn test_rejects_overlong() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(!is_valid(&long));
        assert_eq!(
            validate(&long),
            Err(RoutingError::InvalidAgentName(long.clone()))
        );
    }
}
