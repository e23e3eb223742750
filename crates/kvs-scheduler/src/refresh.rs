//! Southbound refresh
//!
//! Retrieves the actual state of every descriptor that supports it, in
//! retrieve-dependency order, and reconciles the graph with it. The graph is
//! corrected in place; what still has to be executed is returned as plan
//! inputs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::descriptor::{KvDescriptor, OpContext};
use crate::error::{DescriptorError, SchedulerError};
use crate::graph::{GraphWriter, Node, ValueState};
use crate::planner::PlanInput;
use crate::registry::Registry;
use crate::value::{describe, ErasedKv, ValueOrigin};

/// What to refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RefreshOptions {
    /// Descriptors to retrieve; all when `None`
    pub descriptors: Option<Vec<String>>,
    /// Overrides the configured strict mode
    pub strict: Option<bool>,
}

impl RefreshOptions {
    /// Refresh every descriptor that supports retrieve
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Refresh only the named descriptors
    #[must_use]
    pub fn only(descriptors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            descriptors: Some(descriptors.into_iter().map(Into::into).collect()),
            strict: None,
        }
    }

    /// Override the configured strict mode for this refresh
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }
}

/// Outcome of a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RefreshReport {
    /// Values returned by descriptors
    pub retrieved: usize,
    /// NB values found as intended
    pub adopted: Vec<String>,
    /// NB values found with a different value
    pub corrected: Vec<String>,
    /// NB values missing from the southbound
    pub missing: Vec<String>,
    /// Southbound values without NB intent, kept as obtained
    pub unmanaged: Vec<String>,
    /// Values scheduled for removal
    pub removed: Vec<String>,
    /// Retrieve failures per descriptor
    pub errors: BTreeMap<String, String>,
}

impl RefreshReport {
    /// Nothing had to be corrected, recreated or removed
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrected.is_empty()
            && self.missing.is_empty()
            && self.removed.is_empty()
            && self.errors.is_empty()
    }
}

/// Reconcile the graph with the southbound
///
/// # Errors
/// Fails only when retrieve dependencies between descriptors form a cycle;
/// retrieve failures of single descriptors end up in the report.
pub(crate) async fn reconcile(
    registry: &Registry,
    graph: &mut GraphWriter,
    seq: u64,
    opts: &RefreshOptions,
    strict: bool,
) -> Result<(RefreshReport, Vec<PlanInput>), SchedulerError> {
    let mut report = RefreshReport::default();
    let mut inputs = Vec::new();

    for name in registry.retrieve_order()? {
        if let Some(only) = &opts.descriptors {
            if !only.contains(&name) {
                continue;
            }
        }
        let Some(descriptor) = registry.get(&name).cloned() else {
            continue;
        };
        if !descriptor.supports_retrieve() {
            continue;
        }

        let correlate: Vec<ErasedKv> = graph
            .nodes_by_descriptor(&name)
            .filter(|node| node.origin() != ValueOrigin::FromSb)
            .filter_map(|node| {
                node.value().map(|value| ErasedKv {
                    key: node.key().to_string(),
                    value: Arc::clone(value),
                    metadata: node.metadata.clone(),
                    origin: node.origin(),
                })
            })
            .collect();

        // descriptors retrieved later see metadata adopted so far
        let ctx = OpContext::new(graph.freeze(), seq);
        let retrieved = match retrieve(&descriptor, ctx, correlate).await {
            Ok(values) => values,
            Err(err) => {
                warn!(seq, descriptor = %name, error = %err, "retrieve failed");
                report.errors.insert(name.clone(), err.to_string());
                continue;
            }
        };
        debug!(seq, descriptor = %name, count = retrieved.len(), "retrieved");
        report.retrieved += retrieved.len();

        let mut seen = BTreeSet::new();
        for kv in retrieved {
            if !descriptor.matches(&kv.key) {
                warn!(seq, descriptor = %name, key = %kv.key, "retrieved key outside of descriptor");
                continue;
            }
            seen.insert(kv.key.clone());
            correlate_one(&descriptor, graph, seq, kv, strict, &mut report, &mut inputs);
        }

        let vanished: Vec<Node> = graph
            .nodes_by_descriptor(&name)
            .filter(|node| !seen.contains(node.key()) && node.applied.is_some())
            .cloned()
            .collect();
        for node in vanished {
            let key = node.key().to_string();
            if node.origin() == ValueOrigin::FromSb {
                report.removed.push(key.clone());
                inputs.push(PlanInput::delete(key));
            } else if node.value().is_some() {
                if let Some(n) = graph.node_mut(&key) {
                    n.applied = None;
                    n.applied_dependencies.clear();
                    n.metadata = None;
                    n.state = ValueState::Pending;
                    n.last_update = seq;
                }
                report.missing.push(key.clone());
                inputs.push(PlanInput::Reapply { key });
            }
        }
    }

    info!(
        seq,
        retrieved = report.retrieved,
        corrected = report.corrected.len(),
        missing = report.missing.len(),
        removed = report.removed.len(),
        errors = report.errors.len(),
        "refresh finished"
    );
    Ok((report, inputs))
}

async fn retrieve(
    descriptor: &Arc<dyn KvDescriptor>,
    ctx: OpContext,
    correlate: Vec<ErasedKv>,
) -> Result<Vec<ErasedKv>, DescriptorError> {
    let descriptor = Arc::clone(descriptor);
    tokio::task::spawn_blocking(move || descriptor.retrieve(&ctx, &correlate))
        .await
        .map_err(|err| DescriptorError::Failed(format!("retrieve aborted: {err}")))?
}

fn correlate_one(
    descriptor: &Arc<dyn KvDescriptor>,
    graph: &mut GraphWriter,
    seq: u64,
    kv: ErasedKv,
    strict: bool,
    report: &mut RefreshReport,
    inputs: &mut Vec<PlanInput>,
) {
    let key = kv.key.clone();
    let existing = graph.get_node(&key).cloned();

    match existing {
        Some(node) if node.origin() != ValueOrigin::FromSb && node.value().is_some() => {
            let adopted = node
                .value()
                .is_some_and(|intent| descriptor.equivalent(&key, intent, &kv.value));
            let was_configured = node.state() == ValueState::Configured && node.error().is_none();
            let applied_dependencies = descriptor.dependencies(&key, &kv.value);
            if let Some(n) = graph.node_mut(&key) {
                n.applied = Some(kv.value);
                n.applied_dependencies = applied_dependencies;
                n.metadata = kv.metadata;
                n.last_update = seq;
            }
            if adopted {
                report.adopted.push(key.clone());
                if !was_configured {
                    inputs.push(PlanInput::Reapply { key });
                }
            } else {
                report.corrected.push(key.clone());
                inputs.push(PlanInput::Reapply { key });
            }
        }
        Some(node) if node.origin() == ValueOrigin::FromSb => {
            let changed = node
                .value()
                .map_or(true, |current| describe(&**current) != describe(&*kv.value));
            if changed {
                inputs.push(PlanInput::Put {
                    key,
                    value: kv.value,
                    origin: ValueOrigin::FromSb,
                    metadata: kv.metadata,
                });
            } else if let Some(n) = graph.node_mut(&key) {
                n.metadata = kv.metadata;
            }
        }
        _ if strict => {
            let mut node = Node::new(&key, ValueOrigin::FromNb);
            node.descriptor = Some(descriptor.name().to_string());
            node.label = descriptor.key_label(&key);
            node.dependencies = descriptor.dependencies(&key, &kv.value);
            node.applied_dependencies = node.dependencies.clone();
            node.applied = Some(kv.value);
            node.metadata = kv.metadata;
            node.state = ValueState::Configured;
            node.last_update = seq;
            node.intent_seq = seq;
            graph.insert(node);
            report.removed.push(key.clone());
            inputs.push(PlanInput::delete(key));
        }
        _ => {
            report.unmanaged.push(key.clone());
            inputs.push(PlanInput::Put {
                key,
                value: kv.value,
                origin: ValueOrigin::FromSb,
                metadata: kv.metadata,
            });
        }
    }
}
