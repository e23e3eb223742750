use serde::{Deserialize, Serialize};

use crate::descriptor::Dependency;
use crate::error::KvError;
use crate::retry::RetryPolicy;
use crate::value::{MetadataRef, ValueOrigin, ValueRef};

/// Lifecycle state of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueState {
    /// No node for the key
    NonExistent,
    /// Waiting for dependencies
    Pending,
    /// Created in the southbound by the scheduler
    Configured,
    /// Present in the southbound without NB intent
    Obtained,
    /// Rejected by validation
    Invalid,
    /// Retriable failure with attempts left
    Retrying,
    /// Non-retriable failure or attempts exhausted
    Failed,
    /// No descriptor for the key
    Unimplemented,
    /// Removal completed
    Removed,
}

impl ValueState {
    /// Whether the value satisfies dependencies of others
    #[inline]
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Configured | Self::Obtained)
    }

    /// Whether the value ended in an error state
    #[inline]
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Invalid | Self::Retrying | Self::Failed)
    }
}

/// One value in the graph
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) descriptor: Option<String>,
    pub(crate) label: String,
    pub(crate) origin: ValueOrigin,
    /// Desired value; `None` once removal was requested
    pub(crate) intent: Option<ValueRef>,
    /// Value currently present in the southbound
    pub(crate) applied: Option<ValueRef>,
    pub(crate) metadata: Option<MetadataRef>,
    pub(crate) state: ValueState,
    pub(crate) error: Option<KvError>,
    pub(crate) derived_from: Option<String>,
    pub(crate) dependencies: Vec<Dependency>,
    /// Dependencies of `applied`; kept until that value leaves the southbound
    pub(crate) applied_dependencies: Vec<Dependency>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) attempts: u32,
    /// Transaction that last touched the node
    pub(crate) last_update: u64,
    /// Transaction that last changed the intent
    pub(crate) intent_seq: u64,
}

impl Node {
    pub(crate) fn new(key: impl Into<String>, origin: ValueOrigin) -> Self {
        let key = key.into();
        Self {
            label: key.clone(),
            key,
            descriptor: None,
            origin,
            intent: None,
            applied: None,
            metadata: None,
            state: ValueState::Pending,
            error: None,
            derived_from: None,
            dependencies: Vec::new(),
            applied_dependencies: Vec::new(),
            retry: None,
            attempts: 0,
            last_update: 0,
            intent_seq: 0,
        }
    }

    /// Key of the value
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name of the owning descriptor; `None` for properties and unimplemented keys
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    /// Key label given by the descriptor
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Where the value came from
    #[inline]
    #[must_use]
    pub fn origin(&self) -> ValueOrigin {
        self.origin
    }

    /// Desired value
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&ValueRef> {
        self.intent.as_ref()
    }

    /// Value last written to or observed in the southbound
    #[inline]
    #[must_use]
    pub fn applied_value(&self) -> Option<&ValueRef> {
        self.applied.as_ref()
    }

    /// Metadata, exposed only while the value is available
    #[inline]
    #[must_use]
    pub fn metadata(&self) -> Option<&MetadataRef> {
        if self.state.is_available() {
            self.metadata.as_ref()
        } else {
            None
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Error of the last attempt, if it failed
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&KvError> {
        self.error.as_ref()
    }

    /// Parent key of a derived value
    #[inline]
    #[must_use]
    pub fn derived_from(&self) -> Option<&str> {
        self.derived_from.as_deref()
    }

    /// Whether the value was derived from another one
    #[inline]
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Derived value without a descriptor; it has no southbound state
    #[inline]
    #[must_use]
    pub fn is_property(&self) -> bool {
        self.derived_from.is_some() && self.descriptor.is_none()
    }

    /// Dependencies of the intended value
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Dependencies of the value currently in the southbound
    ///
    /// They differ from [`Node::dependencies`] while a changed intent has not
    /// been applied yet, e.g. after its teardown or update failed.
    #[inline]
    #[must_use]
    pub fn applied_dependencies(&self) -> &[Dependency] {
        &self.applied_dependencies
    }

    /// Intended and applied dependencies together
    pub(crate) fn all_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().chain(&self.applied_dependencies)
    }

    /// Failed attempts since the intent last changed
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Transaction that last touched the node
    #[inline]
    #[must_use]
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Whether the scheduler manages this value's southbound lifecycle
    pub(crate) fn is_managed(&self) -> bool {
        self.origin != ValueOrigin::FromSb && self.descriptor.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_ref;

    #[test]
    fn metadata_hidden_unless_available() {
        let mut node = Node::new("config/a", ValueOrigin::FromNb);
        node.metadata = Some(value_ref(1_u32));
        node.state = ValueState::Retrying;
        assert!(node.metadata().is_none());
        node.state = ValueState::Configured;
        assert!(node.metadata().is_some());
        node.state = ValueState::Obtained;
        assert!(node.metadata().is_some());
    }

    #[test]
    fn property_detection() {
        let mut node = Node::new("prop/a", ValueOrigin::FromNb);
        assert!(!node.is_property());
        node.derived_from = Some("config/a".into());
        assert!(node.is_property());
        node.descriptor = Some("d".into());
        assert!(!node.is_property());
        assert!(node.is_managed());
    }

    #[test]
    fn state_classes() {
        assert!(ValueState::Configured.is_available());
        assert!(!ValueState::Pending.is_available());
        assert!(ValueState::Invalid.is_failure());
        assert!(!ValueState::Unimplemented.is_failure());
    }
}
