//! Key naming conventions for the KV scheduler
//!
//! Two families of keys exist:
//! - [`ModelKey`]: NB-managed resources, `config/<module>/<api-version>/<resource-type>/<name>`
//! - [`RelationKey`]: derived/relational values, `<module>/<resource>/<id>/<relation>/<target>`
//!
//! Components that are empty or contain disallowed characters are rendered as
//! [`INVALID_KEY_PART`] instead of failing, so malformed keys still parse back
//! into the same structure for diagnostics.

mod model;
mod relation;

pub use model::{prefix_for, ModelKey};
pub use relation::RelationKey;

use std::borrow::Cow;

/// Token substituted for empty or malformed key components
pub const INVALID_KEY_PART: &str = "<invalid>";

/// Root segment of every NB-managed key
pub const CONFIG_ROOT: &str = "config";

/// Key separator
pub const SEPARATOR: char = '/';

/// Errors raised when a string does not have the structure of a key family
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Key does not start with the expected root
    #[error("key '{key}' does not start with '{expected}'")]
    WrongRoot { key: String, expected: String },

    /// Key has fewer components than the family requires
    #[error("key '{key}' has {found} components, expected at least {expected}")]
    TooFewComponents {
        key: String,
        found: usize,
        expected: usize,
    },
}

/// Check whether a single key component is well-formed
///
/// A component must be non-empty and free of separators, whitespace and
/// control characters.
#[inline]
#[must_use]
pub fn is_valid_part(part: &str) -> bool {
    !part.is_empty()
        && part != INVALID_KEY_PART
        && !part
            .chars()
            .any(|c| c == SEPARATOR || c.is_whitespace() || c.is_control())
}

/// Render a component, substituting [`INVALID_KEY_PART`] when malformed
#[inline]
#[must_use]
pub fn sanitize_part(part: &str) -> Cow<'_, str> {
    if is_valid_part(part) {
        Cow::Borrowed(part)
    } else {
        Cow::Borrowed(INVALID_KEY_PART)
    }
}

/// Render a trailing component, which may span several segments
///
/// Used for names and targets: interior separators are allowed, but empty
/// segments, whitespace and control characters are not.
#[must_use]
pub fn sanitize_tail(tail: &str) -> Cow<'_, str> {
    if !tail.is_empty() && tail.split(SEPARATOR).all(is_valid_part) {
        Cow::Borrowed(tail)
    } else {
        Cow::Borrowed(INVALID_KEY_PART)
    }
}

/// Parse a component back, mapping empty input to [`INVALID_KEY_PART`]
#[inline]
pub(crate) fn parse_part(part: &str) -> String {
    if part.is_empty() {
        INVALID_KEY_PART.to_string()
    } else {
        part.to_string()
    }
}

/// Check whether `key` falls under `prefix`
///
/// Plain string prefix test. Type prefixes end with a separator, so
/// `config/vpp/v2/abf/` covers `config/vpp/v2/abf/abf-1` but not `config/vpp/v2/abfx/a`.
#[inline]
#[must_use]
pub fn has_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_parts() {
        assert!(is_valid_part("abf"));
        assert!(is_valid_part("v2"));
        assert!(is_valid_part("if-1.100"));
    }

    #[test]
    fn invalid_parts() {
        assert!(!is_valid_part(""));
        assert!(!is_valid_part("a/b"));
        assert!(!is_valid_part("with space"));
        assert!(!is_valid_part(INVALID_KEY_PART));
    }

    #[test]
    fn sanitize_substitutes_token() {
        assert_eq!(sanitize_part("acl1"), "acl1");
        assert_eq!(sanitize_part(""), INVALID_KEY_PART);
        assert_eq!(sanitize_part("a b"), INVALID_KEY_PART);
    }

    #[test]
    fn sanitize_tail_allows_interior_separator() {
        assert_eq!(sanitize_tail("memif1/1"), "memif1/1");
        assert_eq!(sanitize_tail("memif1//1"), INVALID_KEY_PART);
        assert_eq!(sanitize_tail(""), INVALID_KEY_PART);
    }

    #[test]
    fn prefix_match() {
        assert!(has_prefix("config/vpp/v2/abf/abf-1", "config/vpp/v2/abf/"));
        assert!(!has_prefix("config/vpp/v2/acl/acl1", "config/vpp/v2/abf/"));
    }
}
