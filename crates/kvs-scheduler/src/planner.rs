//! Transaction planner
//!
//! Turns a batch of requested changes into an ordered plan against the
//! current graph:
//! 1. dependencies and derived values are computed for the proposed values
//! 2. explicit dependency cycles reject the whole batch
//! 3. removals cascade to derived values and to dependents losing their
//!    last candidate; they run dependents-first
//! 4. applies run dependencies-first
//!
//! Unrelated keys are ordered lexicographically.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::Dag;
use crate::descriptor::{Dependency, DependencyTarget};
use crate::error::SchedulerError;
use crate::graph::GraphSnapshot;
use crate::registry::Registry;
use crate::value::{describe, KeyValuePair, MetadataRef, Operation, ValueOrigin, ValueRef};

/// One requested change
#[derive(Debug, Clone)]
pub enum PlanInput {
    /// Set the value of a key
    Put {
        key: String,
        value: ValueRef,
        origin: ValueOrigin,
        metadata: Option<MetadataRef>,
    },
    /// Remove a key
    Delete { key: String },
    /// Converge an existing node towards its current intent
    Reapply { key: String },
}

impl PlanInput {
    /// NB put
    #[must_use]
    pub fn put(key: impl Into<String>, value: ValueRef) -> Self {
        Self::Put {
            key: key.into(),
            value,
            origin: ValueOrigin::FromNb,
            metadata: None,
        }
    }

    /// Delete input for `key`
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Key the input refers to
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::Reapply { key } => key,
        }
    }
}

/// Kind of planned step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlannedAction {
    /// Create or update toward the intent
    Apply,
    /// Delete the value and drop its intent
    Remove,
    /// Dependency lost: southbound state removed, intent kept
    Unconfigure,
    /// Re-attempt a previously failed value
    Retry,
}

/// Planned step as reported to callers and history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOp {
    /// Key of the step
    pub key: String,
    /// What the step does to the key
    pub action: PlannedAction,
    /// Predicted southbound operation
    pub operation: Option<Operation>,
    /// Update predicted to be carried out as Delete+Create
    pub recreate: bool,
    /// Description of the value being applied
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum StepAction {
    Apply {
        value: ValueRef,
        origin: ValueOrigin,
        metadata: Option<MetadataRef>,
        derived_from: Option<String>,
    },
    Remove,
    Unconfigure,
    Reapply,
}

impl StepAction {
    pub(crate) fn is_teardown(&self) -> bool {
        matches!(self, Self::Remove | Self::Unconfigure)
    }

    /// Removals run before applies
    pub(crate) fn phase(&self) -> u8 {
        u8::from(!self.is_teardown())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedStep {
    pub(crate) key: String,
    pub(crate) action: StepAction,
    /// Keys whose steps must finish first
    pub(crate) after: BTreeSet<String>,
}

/// Ordered execution plan
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub(crate) steps: Vec<PlannedStep>,
    ops: Vec<PlannedOp>,
}

impl Plan {
    /// Planned steps in execution order
    #[must_use]
    pub fn ops(&self) -> &[PlannedOp] {
        &self.ops
    }

    /// Keys in execution order
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.key.as_str()).collect()
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Computes plans against a graph snapshot
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    registry: &'a Registry,
}

impl<'a> Planner<'a> {
    /// Planner resolving descriptors through `registry`
    #[must_use]
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Plan a batch; later inputs for the same key override earlier ones
    ///
    /// # Errors
    /// [`SchedulerError::DependencyCycle`] when explicit dependencies of the
    /// proposed values form a cycle.
    pub fn plan(&self, graph: &GraphSnapshot, inputs: Vec<PlanInput>) -> Result<Plan, SchedulerError> {
        let mut batch: BTreeMap<String, PlanInput> = BTreeMap::new();
        for input in inputs {
            batch.insert(input.key().to_string(), input);
        }

        let (proposed, derived) = self.proposed_relations(graph, &batch);
        self.check_cycles(graph, &batch, &proposed, &derived)?;

        let removals = self.removal_cascade(graph, &batch, &proposed);

        let mut removal_dag = Dag::new();
        for key in removals.keys() {
            removal_dag.add_node(key);
        }
        for key in removals.keys() {
            for target in graph.dependencies(key) {
                if removals.contains_key(&target) {
                    removal_dag.add_edge(key, &target);
                }
            }
            if let Some(parent) = graph.get_node(key).and_then(|n| n.derived_from()) {
                if removals.contains_key(parent) {
                    removal_dag.add_edge(key, parent);
                }
            }
        }

        let applies: BTreeSet<&String> = batch
            .iter()
            .filter(|(_, input)| !matches!(input, PlanInput::Delete { .. }))
            .map(|(key, _)| key)
            .collect();
        let mut apply_dag = Dag::new();
        for key in &applies {
            apply_dag.add_node(key);
        }
        for key in &applies {
            for dep in proposed.get(*key).map(Vec::as_slice).unwrap_or_default() {
                match &dep.target {
                    DependencyTarget::Key(target) => {
                        if applies.contains(target) {
                            apply_dag.add_edge(target, key);
                        }
                    }
                    DependencyTarget::AnyOf(any) => {
                        for other in applies.iter().filter(|o| **o != *key && any.matches(o)) {
                            apply_dag.add_edge(other, key);
                        }
                    }
                }
            }
        }

        let mut plan = Plan::default();
        for key in removal_dag.lenient_order() {
            let Some(action) = removals.get(&key).cloned() else {
                continue;
            };
            let after = removal_dag.predecessors(&key);
            plan.push(self.predict(graph, &key, &action), PlannedStep { key, action, after });
        }
        for key in apply_dag.lenient_order() {
            let action = match batch.remove(&key) {
                Some(PlanInput::Put {
                    value,
                    origin,
                    metadata,
                    ..
                }) => StepAction::Apply {
                    value,
                    origin,
                    metadata,
                    derived_from: None,
                },
                Some(PlanInput::Reapply { .. }) => StepAction::Reapply,
                _ => continue,
            };
            let after = apply_dag.predecessors(&key);
            plan.push(self.predict(graph, &key, &action), PlannedStep { key, action, after });
        }
        debug!(steps = plan.len(), "planned transaction");
        Ok(plan)
    }

    /// Dependencies and derived values of every value being (re)applied
    fn proposed_relations(
        &self,
        graph: &GraphSnapshot,
        batch: &BTreeMap<String, PlanInput>,
    ) -> (BTreeMap<String, Vec<Dependency>>, BTreeMap<String, Vec<KeyValuePair>>) {
        let mut proposed = BTreeMap::new();
        let mut derived = BTreeMap::new();
        for (key, input) in batch {
            let value = match input {
                PlanInput::Put { value, origin, .. } if *origin != ValueOrigin::FromSb => value.clone(),
                PlanInput::Reapply { .. } => match graph.get_node(key).and_then(|n| n.value()) {
                    Some(value) => value.clone(),
                    None => continue,
                },
                _ => continue,
            };
            if let Some(descriptor) = self.registry.lookup(key) {
                proposed.insert(key.clone(), descriptor.dependencies(key, &value));
                derived.insert(key.clone(), descriptor.derived_values(key, &value));
            }
        }
        (proposed, derived)
    }

    fn check_cycles(
        &self,
        graph: &GraphSnapshot,
        batch: &BTreeMap<String, PlanInput>,
        proposed: &BTreeMap<String, Vec<Dependency>>,
        derived: &BTreeMap<String, Vec<KeyValuePair>>,
    ) -> Result<(), SchedulerError> {
        let mut dag = Dag::new();
        let mut involved: BTreeSet<&str> = batch.keys().map(String::as_str).collect();

        for node in graph.nodes() {
            if batch.contains_key(node.key()) || node.origin() == ValueOrigin::FromSb {
                continue;
            }
            for target in node.dependencies().iter().filter_map(Dependency::key) {
                dag.add_edge(target, node.key());
            }
            if let Some(parent) = node.derived_from() {
                dag.add_edge(parent, node.key());
            }
        }
        for (key, deps) in proposed {
            for target in deps.iter().filter_map(Dependency::key) {
                dag.add_edge(target, key);
            }
        }
        for (parent, kvs) in derived {
            for kv in kvs {
                involved.insert(&kv.key);
                dag.add_edge(parent, &kv.key);
                if let Some(descriptor) = self.registry.lookup(&kv.key) {
                    for dep in descriptor.dependencies(&kv.key, &kv.value) {
                        if let Some(target) = dep.key() {
                            dag.add_edge(target, &kv.key);
                        }
                    }
                }
            }
        }

        match dag
            .cycles()
            .into_iter()
            .find(|cycle| cycle.iter().any(|k| involved.contains(k.as_str())))
        {
            Some(keys) => Err(SchedulerError::DependencyCycle { keys }),
            None => Ok(()),
        }
    }

    /// Removal steps implied by the batch's deletes
    fn removal_cascade(
        &self,
        graph: &GraphSnapshot,
        batch: &BTreeMap<String, PlanInput>,
        proposed: &BTreeMap<String, Vec<Dependency>>,
    ) -> BTreeMap<String, StepAction> {
        let mut removals: BTreeMap<String, StepAction> = BTreeMap::new();
        let mut work: Vec<String> = Vec::new();
        for (key, input) in batch {
            if matches!(input, PlanInput::Delete { .. }) && graph.contains(key) {
                removals.insert(key.clone(), StepAction::Remove);
                work.push(key.clone());
            }
        }

        while let Some(key) = work.pop() {
            for child in graph.derived_children(&key) {
                if !removals.contains_key(&child) {
                    removals.insert(child.clone(), StepAction::Remove);
                    work.push(child);
                }
            }
            let excluded: BTreeSet<String> = removals.keys().cloned().collect();
            for dependent in graph.dependents(&key) {
                if removals.contains_key(&dependent) {
                    continue;
                }
                let Some(node) = graph.get_node(&dependent) else {
                    continue;
                };
                if node.applied_value().is_none() || node.origin() == ValueOrigin::FromSb {
                    continue;
                }
                // the southbound value keeps relying on what it was applied with
                let intended = proposed
                    .get(&dependent)
                    .map_or(node.dependencies(), Vec::as_slice);
                let loses_dependency = intended
                    .iter()
                    .chain(node.applied_dependencies())
                    .any(|d| d.refers_to(&key) && !graph.dependency_satisfied(d, &excluded));
                if loses_dependency {
                    removals.insert(dependent.clone(), StepAction::Unconfigure);
                    work.push(dependent);
                }
            }
        }
        removals
    }

    fn predict(&self, graph: &GraphSnapshot, key: &str, action: &StepAction) -> PlannedOp {
        let node = graph.get_node(key);
        let descriptor = self.registry.lookup(key);
        let mut op = PlannedOp {
            key: key.to_string(),
            action: PlannedAction::Apply,
            operation: None,
            recreate: false,
            value: None,
        };

        let intent = match action {
            StepAction::Apply { value, origin, .. } => {
                op.value = Some(describe(&**value));
                (*origin != ValueOrigin::FromSb).then(|| value.clone())
            }
            StepAction::Reapply => {
                op.action = PlannedAction::Retry;
                node.and_then(|n| n.value().cloned())
            }
            StepAction::Remove | StepAction::Unconfigure => {
                op.action = if matches!(action, StepAction::Remove) {
                    PlannedAction::Remove
                } else {
                    PlannedAction::Unconfigure
                };
                if node.is_some_and(|n| n.applied_value().is_some() && n.is_managed()) {
                    op.operation = Some(Operation::Delete);
                }
                return op;
            }
        };

        let (Some(intent), Some(descriptor)) = (intent, descriptor) else {
            return op;
        };
        match node.and_then(|n| n.applied_value()) {
            None => op.operation = Some(Operation::Create),
            Some(applied) if descriptor.equivalent(key, applied, &intent) => {}
            Some(applied) => {
                op.operation = Some(Operation::Update);
                op.recreate = !descriptor.supports_update()
                    || descriptor.update_with_recreate(
                        key,
                        applied,
                        &intent,
                        node.and_then(|n| n.metadata.as_ref()),
                    );
            }
        }
        op
    }
}

impl Plan {
    fn push(&mut self, op: PlannedOp, step: PlannedStep) {
        self.ops.push(op);
        self.steps.push(step);
    }
}
