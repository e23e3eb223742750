//! Descriptor SPI
//!
//! A descriptor teaches the scheduler how to turn one key-space into
//! southbound state. Plugins implement the typed [`Descriptor`] trait; the
//! registry stores it behind the erased [`KvDescriptor`] through
//! [`DescriptorAdapter`], so metadata types are checked at compile time on the
//! plugin side.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::error::DescriptorError;
use crate::graph::GraphSnapshot;
use crate::value::{downcast, ErasedKv, KeyValuePair, KvWithMetadata, MetadataRef, ValueRef};

/// Predicate over keys
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Predicate dependency satisfied by any existing matching key
#[derive(Clone, Default)]
pub struct AnyOf {
    /// Candidate key prefixes; empty means every key is a candidate
    pub key_prefixes: Vec<String>,
    /// Optional filter applied on top of the prefixes
    pub selector: Option<KeySelector>,
}

impl AnyOf {
    /// Whether `key` is a candidate
    ///
    /// Without prefixes a selector is required, otherwise nothing matches.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        let prefixed = self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        match &self.selector {
            Some(selector) => (self.key_prefixes.is_empty() || prefixed) && selector(key),
            None => prefixed,
        }
    }
}

impl Debug for AnyOf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyOf")
            .field("key_prefixes", &self.key_prefixes)
            .field("selector", &self.selector.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// What a dependency points at
#[derive(Debug, Clone)]
pub enum DependencyTarget {
    /// Exactly this key
    Key(String),
    /// Any key matched by the selector
    AnyOf(AnyOf),
}

/// Labelled dependency of a value
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Name used in logs and unmet dependency reports
    pub label: String,
    /// Key or key set the dependency points at
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on one exact key
    #[must_use]
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency satisfied by any key under one of `prefixes`
    #[must_use]
    pub fn any_of(label: impl Into<String>, prefixes: Vec<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(AnyOf {
                key_prefixes: prefixes,
                selector: None,
            }),
        }
    }

    /// Dependency satisfied by any key accepted by `selector`
    #[must_use]
    pub fn any_matching(
        label: impl Into<String>,
        prefixes: Vec<String>,
        selector: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(AnyOf {
                key_prefixes: prefixes,
                selector: Some(Arc::new(selector)),
            }),
        }
    }

    /// Exact key, if this is a key dependency
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match &self.target {
            DependencyTarget::Key(key) => Some(key),
            DependencyTarget::AnyOf(_) => None,
        }
    }

    /// Whether `key` could satisfy this dependency
    #[must_use]
    pub fn refers_to(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(target) => target == key,
            DependencyTarget::AnyOf(any) => any.matches(key),
        }
    }

    /// Human readable form used in unmet-dependency reports
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.target {
            DependencyTarget::Key(key) => key.clone(),
            DependencyTarget::AnyOf(_) => format!("any-of:{}", self.label),
        }
    }
}

/// Metadata that carries a southbound index, enabling lookup by index
pub trait IndexedMetadata {
    /// Southbound index
    fn index(&self) -> u32;
}

/// Read-only access to graph state while a descriptor callback runs
///
/// Reflects the transaction's working graph at the start of the current
/// execution wave. Metadata of other descriptors' values is exposed read-only.
#[derive(Clone)]
pub struct OpContext {
    graph: Arc<GraphSnapshot>,
    txn_seq: u64,
}

impl OpContext {
    /// Context over a frozen graph for transaction `txn_seq`
    #[must_use]
    pub fn new(graph: Arc<GraphSnapshot>, txn_seq: u64) -> Self {
        Self { graph, txn_seq }
    }

    /// Sequence number of the running transaction
    #[inline]
    #[must_use]
    pub fn txn_seq(&self) -> u64 {
        self.txn_seq
    }

    /// Graph state visible to the callback
    #[inline]
    #[must_use]
    pub fn graph(&self) -> &GraphSnapshot {
        &self.graph
    }

    /// Metadata of an available (configured or obtained) value
    #[must_use]
    pub fn metadata<M: Any>(&self, key: &str) -> Option<&M> {
        self.graph
            .get_node(key)
            .and_then(|node| node.metadata())
            .and_then(|meta| downcast::<M>(&**meta))
    }

    /// Intended value of a node
    #[must_use]
    pub fn value<V: Any>(&self, key: &str) -> Option<&V> {
        self.graph
            .get_node(key)
            .and_then(|node| node.value())
            .and_then(|value| downcast::<V>(&**value))
    }

    /// Metadata of every available value owned by a descriptor
    #[must_use]
    pub fn metadata_view<M: Any + Clone>(&self, descriptor: &str) -> MetadataView<M> {
        MetadataView::from_graph(&self.graph, descriptor)
    }
}

impl Debug for OpContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("txn_seq", &self.txn_seq)
            .field("nodes", &self.graph.len())
            .finish()
    }
}

/// Read-only metadata map of one descriptor, keyed by value label
#[derive(Debug, Clone)]
pub struct MetadataView<M> {
    entries: BTreeMap<String, (String, M)>,
}

impl<M: Any + Clone> MetadataView<M> {
    pub(crate) fn from_graph(graph: &GraphSnapshot, descriptor: &str) -> Self {
        let entries = graph
            .nodes_by_descriptor(descriptor)
            .filter_map(|node| {
                let meta = node.metadata().and_then(|m| downcast::<M>(&**m))?;
                Some((node.label().to_string(), (node.key().to_string(), meta.clone())))
            })
            .collect();
        Self { entries }
    }

    /// Metadata by value label (the key without descriptor prefix)
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&M> {
        self.entries.get(label).map(|(_, meta)| meta)
    }

    /// Metadata by full key
    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<&M> {
        self.entries
            .values()
            .find(|(k, _)| k == key)
            .map(|(_, meta)| meta)
    }

    /// Iterate `(label, key, metadata)` in label order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &M)> {
        self.entries
            .iter()
            .map(|(label, (key, meta))| (label.as_str(), key.as_str(), meta))
    }

    /// Number of values with metadata
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no value has metadata
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M: Any + Clone + IndexedMetadata> MetadataView<M> {
    /// Label and metadata of the value holding `index`
    #[must_use]
    pub fn lookup_by_index(&self, index: u32) -> Option<(&str, &M)> {
        self.entries
            .iter()
            .find(|(_, (_, meta))| meta.index() == index)
            .map(|(label, (_, meta))| (label.as_str(), meta))
    }
}

/// Typed descriptor implemented by plugins
///
/// Only `name`, `create` and `delete` are mandatory. Key ownership defaults
/// to `key_prefix`; a descriptor without a prefix must override
/// `key_selector`.
pub trait Descriptor: Send + Sync + 'static {
    /// Value type handled by the descriptor
    type Value: Debug + Clone + PartialEq + Send + Sync + 'static;
    /// Metadata returned by create and update
    type Metadata: Debug + Clone + Send + Sync + 'static;

    /// Unique descriptor name
    fn name(&self) -> &str;

    /// Prefix of every key owned by this descriptor
    fn key_prefix(&self) -> Option<&str> {
        None
    }

    /// Whether the descriptor owns `key`
    ///
    /// Registration checks overlap between key prefixes only. A descriptor
    /// that overrides this (with or without a prefix) is trusted not to claim
    /// keys owned by another descriptor.
    fn key_selector(&self, key: &str) -> bool {
        self.key_prefix().is_some_and(|prefix| key.starts_with(prefix))
    }

    /// Prefix under which northbound clients publish values of this descriptor
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    /// Short label of a key, used for metadata lookup by name
    fn key_label(&self, key: &str) -> String {
        self.key_prefix()
            .and_then(|prefix| key.strip_prefix(prefix))
            .unwrap_or(key)
            .to_string()
    }

    /// Whether two values need no southbound change between them
    fn equivalent(&self, _key: &str, old: &Self::Value, new: &Self::Value) -> bool {
        old == new
    }

    /// Reject a value before any southbound call
    fn validate(&self, _key: &str, _value: &Self::Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    /// Add the value to the southbound
    fn create(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &Self::Value,
    ) -> Result<Self::Metadata, DescriptorError>;

    /// Whether `update` is implemented
    fn supports_update(&self) -> bool {
        false
    }

    /// Change the southbound value in place
    fn update(
        &self,
        _ctx: &OpContext,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> Result<Self::Metadata, DescriptorError> {
        Err(DescriptorError::UpdateUnsupported(self.name().to_string()))
    }

    /// Force Delete+Create instead of an in-place update
    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &Self::Value,
        _new: &Self::Value,
        _metadata: Option<&Self::Metadata>,
    ) -> bool {
        false
    }

    /// Remove the value from the southbound
    fn delete(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &Self::Value,
        metadata: Option<&Self::Metadata>,
    ) -> Result<(), DescriptorError>;

    /// Whether `retrieve` is implemented
    fn supports_retrieve(&self) -> bool {
        false
    }

    /// Read southbound state; `correlate` holds the NB values of this
    /// descriptor with their last known metadata
    fn retrieve(
        &self,
        _ctx: &OpContext,
        _correlate: &[KvWithMetadata<Self::Value, Self::Metadata>],
    ) -> Result<Vec<KvWithMetadata<Self::Value, Self::Metadata>>, DescriptorError> {
        Err(DescriptorError::RetrieveUnsupported(self.name().to_string()))
    }

    /// Whether a failed call is worth retrying
    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        err.is_retriable_by_default()
    }

    /// Values that must be available before this one is applied
    fn dependencies(&self, _key: &str, _value: &Self::Value) -> Vec<Dependency> {
        Vec::new()
    }

    /// Values derived from this one
    fn derived_values(&self, _key: &str, _value: &Self::Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Descriptors whose retrieve must run before this one
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Erased descriptor as stored by the registry
pub trait KvDescriptor: Send + Sync {
    /// See [`Descriptor::name`]
    fn name(&self) -> &str;
    /// See [`Descriptor::key_prefix`]
    fn key_prefix(&self) -> Option<&str>;
    /// See [`Descriptor::nb_key_prefix`]
    fn nb_key_prefix(&self) -> Option<&str>;
    /// See [`Descriptor::key_selector`]
    fn matches(&self, key: &str) -> bool;
    /// See [`Descriptor::key_label`]
    fn key_label(&self, key: &str) -> String;
    /// See [`Descriptor::equivalent`]
    fn equivalent(&self, key: &str, old: &ValueRef, new: &ValueRef) -> bool;
    /// See [`Descriptor::validate`]
    fn validate(&self, key: &str, value: &ValueRef) -> Result<(), DescriptorError>;
    /// See [`Descriptor::create`]
    fn create(&self, ctx: &OpContext, key: &str, value: &ValueRef)
        -> Result<MetadataRef, DescriptorError>;
    /// See [`Descriptor::supports_update`]
    fn supports_update(&self) -> bool;
    /// See [`Descriptor::update`]
    fn update(
        &self,
        ctx: &OpContext,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> Result<MetadataRef, DescriptorError>;
    /// See [`Descriptor::update_with_recreate`]
    fn update_with_recreate(
        &self,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> bool;
    /// See [`Descriptor::delete`]
    fn delete(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> Result<(), DescriptorError>;
    /// See [`Descriptor::supports_retrieve`]
    fn supports_retrieve(&self) -> bool;
    /// See [`Descriptor::retrieve`]
    fn retrieve(&self, ctx: &OpContext, correlate: &[ErasedKv])
        -> Result<Vec<ErasedKv>, DescriptorError>;
    /// See [`Descriptor::is_retriable_failure`]
    fn is_retriable_failure(&self, err: &DescriptorError) -> bool;
    /// See [`Descriptor::dependencies`]
    fn dependencies(&self, key: &str, value: &ValueRef) -> Vec<Dependency>;
    /// See [`Descriptor::derived_values`]
    fn derived_values(&self, key: &str, value: &ValueRef) -> Vec<KeyValuePair>;
    /// See [`Descriptor::retrieve_dependencies`]
    fn retrieve_dependencies(&self) -> Vec<String>;
}

impl Debug for dyn KvDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvDescriptor")
            .field("name", &self.name())
            .field("key_prefix", &self.key_prefix())
            .finish()
    }
}

/// Bridges a typed [`Descriptor`] to [`KvDescriptor`]
pub struct DescriptorAdapter<D: Descriptor>(pub D);

impl<D: Descriptor> DescriptorAdapter<D> {
    fn typed<'a>(&self, value: &'a ValueRef) -> Result<&'a D::Value, DescriptorError> {
        downcast::<D::Value>(&**value).ok_or_else(|| self.mismatch())
    }

    fn typed_metadata<'a>(
        &self,
        metadata: Option<&'a MetadataRef>,
    ) -> Result<Option<&'a D::Metadata>, DescriptorError> {
        metadata
            .map(|m| downcast::<D::Metadata>(&**m).ok_or_else(|| self.mismatch()))
            .transpose()
    }

    fn mismatch(&self) -> DescriptorError {
        DescriptorError::TypeMismatch {
            descriptor: self.0.name().to_string(),
        }
    }

    fn erase(kv: KvWithMetadata<D::Value, D::Metadata>) -> ErasedKv {
        ErasedKv {
            key: kv.key,
            value: Arc::new(kv.value),
            metadata: kv.metadata.map(|m| Arc::new(m) as MetadataRef),
            origin: kv.origin,
        }
    }
}

impl<D: Descriptor> KvDescriptor for DescriptorAdapter<D> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn key_prefix(&self) -> Option<&str> {
        self.0.key_prefix()
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        self.0.nb_key_prefix()
    }

    fn matches(&self, key: &str) -> bool {
        self.0.key_selector(key)
    }

    fn key_label(&self, key: &str) -> String {
        self.0.key_label(key)
    }

    fn equivalent(&self, key: &str, old: &ValueRef, new: &ValueRef) -> bool {
        match (self.typed(old), self.typed(new)) {
            (Ok(old), Ok(new)) => self.0.equivalent(key, old, new),
            _ => false,
        }
    }

    fn validate(&self, key: &str, value: &ValueRef) -> Result<(), DescriptorError> {
        self.0.validate(key, self.typed(value)?)
    }

    fn create(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &ValueRef,
    ) -> Result<MetadataRef, DescriptorError> {
        let meta = self.0.create(ctx, key, self.typed(value)?)?;
        Ok(Arc::new(meta))
    }

    fn supports_update(&self) -> bool {
        self.0.supports_update()
    }

    fn update(
        &self,
        ctx: &OpContext,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> Result<MetadataRef, DescriptorError> {
        let meta = self.0.update(
            ctx,
            key,
            self.typed(old)?,
            self.typed(new)?,
            self.typed_metadata(metadata)?,
        )?;
        Ok(Arc::new(meta))
    }

    fn update_with_recreate(
        &self,
        key: &str,
        old: &ValueRef,
        new: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> bool {
        match (self.typed(old), self.typed(new), self.typed_metadata(metadata)) {
            (Ok(old), Ok(new), Ok(meta)) => self.0.update_with_recreate(key, old, new, meta),
            _ => true,
        }
    }

    fn delete(
        &self,
        ctx: &OpContext,
        key: &str,
        value: &ValueRef,
        metadata: Option<&MetadataRef>,
    ) -> Result<(), DescriptorError> {
        self.0
            .delete(ctx, key, self.typed(value)?, self.typed_metadata(metadata)?)
    }

    fn supports_retrieve(&self) -> bool {
        self.0.supports_retrieve()
    }

    fn retrieve(
        &self,
        ctx: &OpContext,
        correlate: &[ErasedKv],
    ) -> Result<Vec<ErasedKv>, DescriptorError> {
        let typed: Vec<KvWithMetadata<D::Value, D::Metadata>> = correlate
            .iter()
            .filter_map(|kv| {
                let value = downcast::<D::Value>(&*kv.value)?.clone();
                let metadata = kv
                    .metadata
                    .as_deref()
                    .and_then(|m| downcast::<D::Metadata>(m))
                    .cloned();
                Some(KvWithMetadata {
                    key: kv.key.clone(),
                    value,
                    metadata,
                    origin: kv.origin,
                })
            })
            .collect();
        let retrieved = self.0.retrieve(ctx, &typed)?;
        Ok(retrieved.into_iter().map(Self::erase).collect())
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        self.0.is_retriable_failure(err)
    }

    fn dependencies(&self, key: &str, value: &ValueRef) -> Vec<Dependency> {
        self.typed(value)
            .map(|v| self.0.dependencies(key, v))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &ValueRef) -> Vec<KeyValuePair> {
        self.typed(value)
            .map(|v| self.0.derived_values(key, v))
            .unwrap_or_default()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.0.retrieve_dependencies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_ref;

    #[derive(Debug, Clone, PartialEq)]
    struct Route {
        dst: String,
    }

    struct RouteDescriptor;

    impl Descriptor for RouteDescriptor {
        type Value = Route;
        type Metadata = u32;

        fn name(&self) -> &str {
            "route"
        }

        fn key_prefix(&self) -> Option<&str> {
            Some("config/route/")
        }

        fn validate(&self, _key: &str, value: &Route) -> Result<(), DescriptorError> {
            if value.dst.is_empty() {
                return Err(DescriptorError::invalid("dst", "must not be empty"));
            }
            Ok(())
        }

        fn create(&self, _ctx: &OpContext, _key: &str, _value: &Route) -> Result<u32, DescriptorError> {
            Ok(5)
        }

        fn delete(
            &self,
            _ctx: &OpContext,
            _key: &str,
            _value: &Route,
            _metadata: Option<&u32>,
        ) -> Result<(), DescriptorError> {
            Ok(())
        }
    }

    fn ctx() -> OpContext {
        OpContext::new(Arc::new(GraphSnapshot::default()), 1)
    }

    #[test]
    fn any_of_matching() {
        let by_prefix = AnyOf {
            key_prefixes: vec!["config/if/".into()],
            selector: None,
        };
        assert!(by_prefix.matches("config/if/eth0"));
        assert!(!by_prefix.matches("config/acl/a"));

        let by_selector = AnyOf {
            key_prefixes: vec![],
            selector: Some(Arc::new(|k: &str| k.ends_with("/loop0"))),
        };
        assert!(by_selector.matches("config/if/loop0"));
        assert!(!by_selector.matches("config/if/eth0"));

        assert!(!AnyOf::default().matches("anything"));
    }

    #[test]
    fn dependency_helpers() {
        let dep = Dependency::on_key("acl", "config/acl/acl1");
        assert_eq!(dep.key(), Some("config/acl/acl1"));
        assert!(dep.refers_to("config/acl/acl1"));
        assert_eq!(dep.describe(), "config/acl/acl1");

        let any = Dependency::any_of("iface", vec!["config/if/".into()]);
        assert!(any.key().is_none());
        assert_eq!(any.describe(), "any-of:iface");
    }

    #[test]
    fn adapter_defaults_and_label() {
        let d = DescriptorAdapter(RouteDescriptor);
        assert!(d.matches("config/route/r1"));
        assert!(!d.matches("config/acl/r1"));
        assert_eq!(d.key_label("config/route/r1"), "r1");
        assert!(!d.supports_update());
        assert!(!d.supports_retrieve());
    }

    #[test]
    fn adapter_validates_and_creates() {
        let d = DescriptorAdapter(RouteDescriptor);
        let good = value_ref(Route { dst: "10.0.0.0/8".into() });
        let bad = value_ref(Route { dst: String::new() });

        assert!(d.validate("config/route/r1", &good).is_ok());
        assert!(matches!(
            d.validate("config/route/r1", &bad),
            Err(DescriptorError::InvalidValue { .. })
        ));

        let meta = d.create(&ctx(), "config/route/r1", &good).unwrap();
        assert_eq!(downcast::<u32>(&*meta), Some(&5));
    }

    #[test]
    fn adapter_rejects_wrong_value_type() {
        let d = DescriptorAdapter(RouteDescriptor);
        let wrong = value_ref("not a route".to_string());
        let err = d.validate("config/route/r1", &wrong).unwrap_err();
        assert!(matches!(err, DescriptorError::TypeMismatch { .. }));
        assert!(!d.is_retriable_failure(&err));
        assert!(d.dependencies("config/route/r1", &wrong).is_empty());
    }

    #[test]
    fn adapter_update_unsupported_by_default() {
        let d = DescriptorAdapter(RouteDescriptor);
        let a = value_ref(Route { dst: "a".into() });
        let b = value_ref(Route { dst: "b".into() });
        assert!(!d.equivalent("k", &a, &b));
        assert!(d.equivalent("k", &a, &a.clone()));
        let err = d.update(&ctx(), "k", &a, &b, None).unwrap_err();
        assert!(matches!(err, DescriptorError::UpdateUnsupported(_)));
    }
}
