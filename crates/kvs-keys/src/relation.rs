//! Relational keys for derived values

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{parse_part, sanitize_part, sanitize_tail, KeyError, SEPARATOR};

/// Key of a derived value binding a resource to another object
///
/// Renders as `<module>/<resource>/<id>/<relation>/<target>`, e.g.
/// `vpp/abf/1/interface/if1`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    /// Module of the owning resource
    pub module: String,
    /// Resource type of the owner
    pub resource: String,
    /// Identifier of the owner
    pub id: String,
    /// Relation name
    pub relation: String,
    /// Target the owner is related to
    pub target: String,
}

impl RelationKey {
    /// Create a relation key
    #[must_use]
    pub fn new(
        module: impl Into<String>,
        resource: impl Into<String>,
        id: impl Into<String>,
        relation: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            resource: resource.into(),
            id: id.into(),
            relation: relation.into(),
            target: target.into(),
        }
    }

    /// Prefix shared by every relation of one resource instance
    #[must_use]
    pub fn instance_prefix(&self) -> String {
        format!(
            "{}/{}/{}/",
            sanitize_part(&self.module),
            sanitize_part(&self.resource),
            sanitize_part(&self.id)
        )
    }

    /// Parse a key, returning `None` unless it carries the given relation under
    /// `module/resource`
    #[must_use]
    pub fn parse_relation(key: &str, module: &str, resource: &str, relation: &str) -> Option<Self> {
        let parsed: Self = key.parse().ok()?;
        (parsed.module == module && parsed.resource == resource && parsed.relation == relation)
            .then_some(parsed)
    }
}

impl Display for RelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}",
            self.instance_prefix(),
            sanitize_part(&self.relation),
            sanitize_tail(&self.target)
        )
    }
}

impl FromStr for RelationKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(5, SEPARATOR).collect();
        if parts.len() < 5 {
            return Err(KeyError::TooFewComponents {
                key: s.to_string(),
                found: parts.len(),
                expected: 5,
            });
        }
        Ok(Self {
            module: parse_part(parts[0]),
            resource: parse_part(parts[1]),
            id: parse_part(parts[2]),
            relation: parse_part(parts[3]),
            target: parse_part(parts[4]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_KEY_PART;

    #[test]
    fn render_abf_attachment() {
        let key = RelationKey::new("vpp", "abf", "1", "interface", "if1");
        assert_eq!(key.to_string(), "vpp/abf/1/interface/if1");
        assert_eq!(key.instance_prefix(), "vpp/abf/1/");
    }

    #[test]
    fn empty_target_renders_invalid() {
        let key = RelationKey::new("vpp", "abf", "1", "interface", "");
        assert_eq!(key.to_string(), "vpp/abf/1/interface/<invalid>");
        let parsed: RelationKey = key.to_string().parse().unwrap();
        assert_eq!(parsed.target, INVALID_KEY_PART);
    }

    #[test]
    fn parse_relation_filters() {
        let key = "vpp/abf/7/interface/memif0/1";
        let parsed = RelationKey::parse_relation(key, "vpp", "abf", "interface").unwrap();
        assert_eq!(parsed.id, "7");
        assert_eq!(parsed.target, "memif0/1");
        assert!(RelationKey::parse_relation(key, "vpp", "nat", "interface").is_none());
    }

    #[test]
    fn short_key_rejected() {
        assert!("vpp/abf/1".parse::<RelationKey>().is_err());
    }
}
