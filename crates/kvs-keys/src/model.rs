//! NB model keys

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{parse_part, sanitize_part, sanitize_tail, KeyError, CONFIG_ROOT, SEPARATOR};

/// Key of an NB-managed resource
///
/// Renders as `config/<module>/<version>/<resource_type>/<name>`.
///
/// # Examples
/// - `config/vpp/v2/abf/abf-1`
/// - `config/vpp/acls/v2/acl/acl1`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    /// Owning module, e.g. `vpp`
    pub module: String,
    /// API version, e.g. `v2`
    pub version: String,
    /// Resource type, e.g. `abf`
    pub resource_type: String,
    /// Instance name
    pub name: String,
}

impl ModelKey {
    /// Create a key from its components
    #[must_use]
    pub fn new(
        module: impl Into<String>,
        version: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Key prefix shared by all instances of this resource type
    ///
    /// Always ends with a separator.
    #[must_use]
    pub fn type_prefix(&self) -> String {
        prefix_for(&self.module, &self.version, &self.resource_type)
    }

    /// Render the key, substituting the invalid token where needed
    #[must_use]
    pub fn render(&self) -> String {
        format!("{}{}", self.type_prefix(), sanitize_tail(&self.name))
    }

    /// Whether every component is well-formed
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.render() == self.raw()
    }

    fn raw(&self) -> String {
        [
            CONFIG_ROOT,
            &self.module,
            &self.version,
            &self.resource_type,
            &self.name,
        ]
        .join("/")
    }
}

/// Prefix for a resource type: `config/<module>/<version>/<resource_type>/`
#[must_use]
pub fn prefix_for(module: &str, version: &str, resource_type: &str) -> String {
    format!(
        "{CONFIG_ROOT}/{}/{}/{}/",
        sanitize_part(module),
        sanitize_part(version),
        sanitize_part(resource_type)
    )
}

impl Display for ModelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for ModelKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, SEPARATOR);
        if parts.next() != Some(CONFIG_ROOT) {
            return Err(KeyError::WrongRoot {
                key: s.to_string(),
                expected: CONFIG_ROOT.to_string(),
            });
        }
        let rest: Vec<&str> = parts.collect();
        if rest.len() < 4 {
            return Err(KeyError::TooFewComponents {
                key: s.to_string(),
                found: rest.len() + 1,
                expected: 5,
            });
        }
        Ok(Self {
            module: parse_part(rest[0]),
            version: parse_part(rest[1]),
            resource_type: parse_part(rest[2]),
            name: parse_part(rest[3]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_KEY_PART;
    use proptest::prelude::*;

    #[test]
    fn render_well_formed() {
        let key = ModelKey::new("vpp", "v2", "abf", "abf-1");
        assert_eq!(key.to_string(), "config/vpp/v2/abf/abf-1");
        assert_eq!(key.type_prefix(), "config/vpp/v2/abf/");
        assert!(key.is_valid());
    }

    #[test]
    fn empty_name_renders_invalid() {
        let key = ModelKey::new("vpp", "v2", "abf", "");
        assert_eq!(key.to_string(), "config/vpp/v2/abf/<invalid>");
        assert!(!key.is_valid());
    }

    #[test]
    fn malformed_key_round_trips() {
        let rendered = ModelKey::new("vpp", "", "abf", "x y").to_string();
        assert_eq!(rendered, "config/vpp/<invalid>/abf/<invalid>");
        let parsed: ModelKey = rendered.parse().unwrap();
        assert_eq!(parsed.version, INVALID_KEY_PART);
        assert_eq!(parsed.name, INVALID_KEY_PART);
        assert_eq!(parsed.to_string(), rendered);
    }

    #[test]
    fn name_keeps_interior_separator() {
        let parsed: ModelKey = "config/vpp/v2/interfaces/memif1/1".parse().unwrap();
        assert_eq!(parsed.name, "memif1/1");
    }

    #[test]
    fn trailing_empty_name_parses_as_invalid() {
        let parsed: ModelKey = "config/vpp/v2/abf/".parse().unwrap();
        assert_eq!(parsed.name, INVALID_KEY_PART);
    }

    #[test]
    fn wrong_root_rejected() {
        let err = "vpp/abf/1/interface/if1".parse::<ModelKey>().unwrap_err();
        assert!(matches!(err, KeyError::WrongRoot { .. }));
    }

    #[test]
    fn too_short_rejected() {
        let err = "config/vpp/v2".parse::<ModelKey>().unwrap_err();
        assert!(matches!(err, KeyError::TooFewComponents { found: 3, .. }));
    }

    proptest! {
        #[test]
        fn valid_components_round_trip(
            module in "[a-z]{1,8}",
            version in "v[0-9]",
            kind in "[a-z_]{1,10}",
            name in "[a-zA-Z0-9_.-]{1,16}",
        ) {
            let key = ModelKey::new(module, version, kind, name);
            let parsed: ModelKey = key.to_string().parse().unwrap();
            prop_assert_eq!(parsed, key);
        }

        #[test]
        fn rendered_keys_always_parse(
            module in ".{0,6}",
            name in ".{0,12}",
        ) {
            let rendered = ModelKey::new(module, "v2", "abf", name).to_string();
            let parsed: ModelKey = rendered.parse().unwrap();
            prop_assert_eq!(parsed.to_string(), rendered);
        }
    }
}
