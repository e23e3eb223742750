//! Type-erased values and metadata

use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Anything that can be stored as a value or metadata in the graph
///
/// Blanket-implemented for every `Debug + Send + Sync + 'static` type, so
/// descriptors work with their own plain structs.
pub trait Value: Any + Debug + Send + Sync {
    /// Upcast for downcasting to the concrete type
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Debug + Send + Sync> Value for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared, immutable value handle
pub type ValueRef = Arc<dyn Value>;

/// Shared, immutable metadata handle
pub type MetadataRef = Arc<dyn Value>;

/// Downcast an erased value to a concrete type
///
/// Always goes through the trait object, never through the `Arc` itself
/// (which is a `Value` too).
#[inline]
#[must_use]
pub fn downcast<T: Any>(value: &dyn Value) -> Option<&T> {
    <dyn Value as Value>::as_any(value).downcast_ref::<T>()
}

/// Wrap a concrete value into a [`ValueRef`]
#[inline]
#[must_use]
pub fn value_ref<T: Value>(value: T) -> ValueRef {
    Arc::new(value)
}

/// Render a value for logs and transaction history
#[must_use]
pub fn describe(value: &dyn Value) -> String {
    format!("{value:?}")
}

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueOrigin {
    /// Origin not known yet
    #[default]
    Unknown,
    /// Declared by a northbound client (intent)
    FromNb,
    /// Observed in the southbound dataplane (fact)
    FromSb,
}

/// Southbound operation executed for a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Value was created
    Create,
    /// Value was changed in place
    Update,
    /// Value was removed
    Delete,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Key paired with an erased value
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    /// Key of the value
    pub key: String,
    /// The value itself
    pub value: ValueRef,
}

impl KeyValuePair {
    /// Pair a key with a concrete value
    #[must_use]
    pub fn new<T: Value>(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(value),
        }
    }
}

/// Key, value, optional metadata and origin
///
/// Typed form is what descriptors see in `retrieve`; the erased form
/// ([`ErasedKv`]) is what the scheduler stores and dumps.
#[derive(Debug, Clone, PartialEq)]
pub struct KvWithMetadata<V, M> {
    /// Key of the value
    pub key: String,
    /// The value itself
    pub value: V,
    /// Descriptor metadata, if any
    pub metadata: Option<M>,
    /// Where the value came from
    pub origin: ValueOrigin,
}

/// Erased [`KvWithMetadata`]
pub type ErasedKv = KvWithMetadata<ValueRef, MetadataRef>;

impl ErasedKv {
    /// Typed view of the value
    #[must_use]
    pub fn value_as<T: Any>(&self) -> Option<&T> {
        downcast::<T>(&*self.value)
    }

    /// Typed view of the metadata
    #[must_use]
    pub fn metadata_as<T: Any>(&self) -> Option<&T> {
        self.metadata.as_deref().and_then(downcast::<T>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Acl {
        name: String,
    }

    #[test]
    fn downcast_through_arc() {
        let v: ValueRef = value_ref(Acl { name: "acl1".into() });
        assert_eq!(downcast::<Acl>(&*v).map(|a| a.name.as_str()), Some("acl1"));
        assert!(downcast::<String>(&*v).is_none());
    }

    #[test]
    fn erased_kv_typed_access() {
        let kv = ErasedKv {
            key: "config/acl/acl1".into(),
            value: value_ref(Acl { name: "acl1".into() }),
            metadata: Some(value_ref(7_u32)),
            origin: ValueOrigin::FromSb,
        };
        assert!(kv.value_as::<Acl>().is_some());
        assert_eq!(kv.metadata_as::<u32>(), Some(&7));
    }

    #[test]
    fn describe_uses_debug() {
        assert_eq!(describe(&42_u32), "42");
    }
}
