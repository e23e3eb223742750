use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use im::OrdMap;
use parking_lot::RwLock;

use super::node::{Node, ValueState};
use crate::descriptor::{Dependency, DependencyTarget};
use crate::value::{ValueOrigin, ValueRef};

/// Immutable view of the graph
///
/// Backed by a persistent map, so cloning is cheap and a working copy shares
/// structure with the committed state until it diverges.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    nodes: OrdMap<String, Node>,
    seq: u64,
}

impl GraphSnapshot {
    /// Sequence number of the transaction that produced this snapshot
    #[inline]
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of nodes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by key
    #[inline]
    #[must_use]
    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Whether a node exists for `key`
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// All nodes in key order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes owned by `descriptor`
    pub fn nodes_by_descriptor<'a>(&'a self, descriptor: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |node| node.descriptor() == Some(descriptor))
    }

    /// Nodes with the given origin
    pub fn nodes_by_origin(&self, origin: ValueOrigin) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |node| node.origin() == origin)
    }

    /// Nodes in the given state
    pub fn nodes_in_state(&self, state: ValueState) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |node| node.state() == state)
    }

    /// Whether `key` is Configured or Obtained
    #[must_use]
    pub fn is_available(&self, key: &str) -> bool {
        self.get_node(key).is_some_and(|node| node.state().is_available())
    }

    /// Existing keys the node's intended or applied dependencies resolve to
    #[must_use]
    pub fn dependencies(&self, key: &str) -> Vec<String> {
        let Some(node) = self.get_node(key) else {
            return Vec::new();
        };
        let mut out = BTreeSet::new();
        for dep in node.all_dependencies() {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    if self.contains(target) {
                        out.insert(target.clone());
                    }
                }
                DependencyTarget::AnyOf(any) => {
                    out.extend(
                        self.nodes
                            .keys()
                            .filter(|k| k.as_str() != key && any.matches(k))
                            .cloned(),
                    );
                }
            }
        }
        out.into_iter().collect()
    }

    /// Keys of nodes with an intended or applied dependency that `key` could
    /// satisfy
    #[must_use]
    pub fn dependents(&self, key: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.key() != key && node.all_dependencies().any(|d| d.refers_to(key)))
            .map(|node| node.key().to_string())
            .collect()
    }

    /// Keys of values derived from `key`
    #[must_use]
    pub fn derived_children(&self, key: &str) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.derived_from() == Some(key))
            .map(|node| node.key().to_string())
            .collect()
    }

    /// Whether the dependency is met, ignoring keys in `excluded`
    #[must_use]
    pub fn dependency_satisfied(&self, dep: &Dependency, excluded: &BTreeSet<String>) -> bool {
        match &dep.target {
            DependencyTarget::Key(target) => {
                !excluded.contains(target) && self.is_available(target)
            }
            DependencyTarget::AnyOf(any) => self.nodes.values().any(|node| {
                any.matches(node.key())
                    && node.state().is_available()
                    && !excluded.contains(node.key())
            }),
        }
    }

    /// Descriptions of unmet dependencies; a derived value also needs its
    /// parent to be available
    #[must_use]
    pub fn unmet_dependencies(
        &self,
        node: &Node,
        deps: &[Dependency],
        excluded: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut unmet: Vec<String> = deps
            .iter()
            .filter(|dep| !self.dependency_satisfied(dep, excluded))
            .map(Dependency::describe)
            .collect();
        if let Some(parent) = node.derived_from() {
            if excluded.contains(parent) || !self.is_available(parent) {
                unmet.push(parent.to_string());
            }
        }
        unmet
    }

    /// First key dependency whose target failed for good
    #[must_use]
    pub fn failed_dependency(&self, deps: &[Dependency]) -> Option<String> {
        deps.iter().filter_map(Dependency::key).find_map(|target| {
            self.get_node(target)
                .filter(|node| matches!(node.state(), ValueState::Failed | ValueState::Invalid))
                .map(|node| node.key().to_string())
        })
    }

    /// Create the node or replace its intended value
    pub fn put_node(&mut self, key: &str, value: ValueRef, origin: ValueOrigin) -> &mut Node {
        let node = self
            .nodes
            .entry(key.to_string())
            .or_insert_with(|| Node::new(key, origin));
        node.origin = origin;
        node.intent = Some(value);
        node
    }

    /// Remove the node for `key`
    pub fn delete_node(&mut self, key: &str) -> Option<Node> {
        self.nodes.remove(key)
    }

    pub(crate) fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub(crate) fn insert(&mut self, node: Node) {
        self.nodes.insert(node.key.clone(), node);
    }
}

/// Holder of the committed graph
///
/// Readers get an `Arc` of the last committed snapshot and never observe a
/// running transaction's writes.
#[derive(Debug, Default)]
pub struct GraphStore {
    committed: RwLock<Arc<GraphSnapshot>>,
}

impl GraphStore {
    /// Store holding an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        Arc::clone(&self.committed.read())
    }

    /// Start a working copy of the committed graph
    #[must_use]
    pub fn begin(&self) -> GraphWriter {
        let base = self.snapshot();
        GraphWriter {
            working: (*base).clone(),
            base,
        }
    }

    /// Publish a working copy; dropping a writer instead discards it
    pub fn commit(&self, writer: GraphWriter, seq: u64) -> Arc<GraphSnapshot> {
        let mut working = writer.working;
        working.seq = seq;
        let snapshot = Arc::new(working);
        *self.committed.write() = Arc::clone(&snapshot);
        snapshot
    }
}

/// Working copy of the graph owned by the running transaction
#[derive(Debug)]
pub struct GraphWriter {
    base: Arc<GraphSnapshot>,
    working: GraphSnapshot,
}

impl GraphWriter {
    /// Committed state the working copy started from
    #[must_use]
    pub fn base(&self) -> &Arc<GraphSnapshot> {
        &self.base
    }

    /// Frozen copy of the current working state
    #[must_use]
    pub fn freeze(&self) -> Arc<GraphSnapshot> {
        Arc::new(self.working.clone())
    }
}

impl Deref for GraphWriter {
    type Target = GraphSnapshot;

    fn deref(&self) -> &GraphSnapshot {
        &self.working
    }
}

impl DerefMut for GraphWriter {
    fn deref_mut(&mut self) -> &mut GraphSnapshot {
        &mut self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value_ref;

    fn configured(graph: &mut GraphSnapshot, key: &str, deps: Vec<Dependency>) {
        let node = graph.put_node(key, value_ref(key.to_string()), ValueOrigin::FromNb);
        node.state = ValueState::Configured;
        node.dependencies = deps;
    }

    #[test]
    fn put_get_delete() {
        let mut g = GraphSnapshot::default();
        g.put_node("config/a", value_ref(1_u32), ValueOrigin::FromNb);
        assert!(g.contains("config/a"));
        assert_eq!(g.get_node("config/a").unwrap().state(), ValueState::Pending);
        assert!(g.delete_node("config/a").is_some());
        assert!(g.is_empty());
    }

    #[test]
    fn dependents_and_dependencies() {
        let mut g = GraphSnapshot::default();
        configured(&mut g, "config/acl/acl1", vec![]);
        configured(&mut g, "config/if/if1", vec![]);
        configured(
            &mut g,
            "config/abf/1",
            vec![
                Dependency::on_key("acl", "config/acl/acl1"),
                Dependency::any_of("iface", vec!["config/if/".into()]),
            ],
        );

        assert_eq!(g.dependents("config/acl/acl1"), vec!["config/abf/1".to_string()]);
        assert_eq!(g.dependents("config/if/if9"), vec!["config/abf/1".to_string()]);
        assert_eq!(
            g.dependencies("config/abf/1"),
            vec!["config/acl/acl1".to_string(), "config/if/if1".to_string()]
        );
    }

    #[test]
    fn satisfaction_respects_exclusion_and_state() {
        let mut g = GraphSnapshot::default();
        configured(&mut g, "config/acl/acl1", vec![]);
        let dep = Dependency::on_key("acl", "config/acl/acl1");
        let none = BTreeSet::new();
        assert!(g.dependency_satisfied(&dep, &none));

        let excluded: BTreeSet<String> = ["config/acl/acl1".to_string()].into();
        assert!(!g.dependency_satisfied(&dep, &excluded));

        g.node_mut("config/acl/acl1").unwrap().state = ValueState::Failed;
        assert!(!g.dependency_satisfied(&dep, &none));
        assert_eq!(g.failed_dependency(&[dep]), Some("config/acl/acl1".to_string()));
    }

    #[test]
    fn derived_value_needs_parent() {
        let mut g = GraphSnapshot::default();
        let child = g.put_node("vpp/abf/1/interface/if1", value_ref(()), ValueOrigin::FromNb);
        child.derived_from = Some("config/abf/1".into());
        let child = g.get_node("vpp/abf/1/interface/if1").unwrap().clone();
        assert_eq!(
            g.unmet_dependencies(&child, &[], &BTreeSet::new()),
            vec!["config/abf/1".to_string()]
        );
        configured(&mut g, "config/abf/1", vec![]);
        assert!(g.unmet_dependencies(&child, &[], &BTreeSet::new()).is_empty());
        assert_eq!(g.derived_children("config/abf/1"), vec!["vpp/abf/1/interface/if1".to_string()]);
    }

    #[test]
    fn writer_isolated_until_commit() {
        let store = GraphStore::new();
        let mut writer = store.begin();
        writer.put_node("config/a", value_ref(1_u32), ValueOrigin::FromNb);
        assert!(store.snapshot().is_empty());

        let committed = store.commit(writer, 7);
        assert_eq!(committed.seq(), 7);
        assert!(store.snapshot().contains("config/a"));
    }

    #[test]
    fn dropped_writer_rolls_back() {
        let store = GraphStore::new();
        let mut writer = store.begin();
        writer.put_node("config/a", value_ref(1_u32), ValueOrigin::FromNb);
        drop(writer);
        assert!(store.snapshot().is_empty());
    }
}
