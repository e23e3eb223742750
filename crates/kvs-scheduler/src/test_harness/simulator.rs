//! Randomized scheduler simulator
//!
//! Drives a scheduler over [`MockSouthbound`] with random batches of puts and
//! deletes, injected failures, southbound drift and refreshes, and checks the
//! graph against the southbound after every operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::mock::{MockDescriptor, MockSouthbound, MockValue};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::graph::{GraphSnapshot, ValueState};
use crate::refresh::RefreshOptions;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::value::{downcast, ValueOrigin};

const PREFIX: &str = "sim/";
const DERIVED_PREFIX: &str = "sim-derived/";

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of operations to run
    pub total_operations: u64,
    /// Size of the key space
    pub keys: usize,
    /// Largest number of changes in one transaction
    pub max_batch: usize,
    /// Probability that an operation injects a failure before running
    pub failure_rate: f64,
    /// Worker pool size of the scheduler under test
    pub worker_pool_size: usize,
    /// Stop at the first violated invariant
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            total_operations: 200,
            keys: 16,
            max_batch: 4,
            failure_rate: 0.05,
            worker_pool_size: 4,
            stop_on_first_violation: true,
        }
    }
}

/// Operation generated by the simulator
#[derive(Debug, Clone)]
pub enum SimulatedOperation {
    /// Commit puts (`Some`) and deletes (`None`)
    Txn(Vec<(String, Option<MockValue>)>),
    /// Next southbound call on the key fails for good
    InjectFailure(String),
    /// Value disappears from the southbound, then a refresh runs
    Drift(String),
    /// Refresh the whole graph
    Refresh,
}

/// Invariant checked after every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantCheck {
    /// Southbound saw a value before its dependency or lost a dependency first
    SouthboundOrdering,
    /// Configured values exist in the southbound
    ConfiguredIsPresent,
    /// Configured values have their dependencies available
    ConfiguredDependenciesMet,
    /// Southbound holds nothing the graph does not know as applied
    NoUnknownSouthboundValue,
    /// Graph intents match what the simulator requested
    IntentMatchesRequests,
    /// Pending values do wait for something
    PendingHasUnmetDependency,
}

/// A violated invariant
#[derive(Debug, Clone)]
pub struct Violation {
    /// Operation after which the check failed
    pub operation_index: u64,
    /// Failed check
    pub check: InvariantCheck,
    /// What was wrong
    pub details: String,
}

/// Statistics collected during simulation
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    /// Transactions committed
    pub transactions: u64,
    /// Refreshes run
    pub refreshes: u64,
    /// Failures injected
    pub injected_failures: u64,
    /// Transactions rejected by the planner
    pub rejected: u64,
    /// Values that ended failed
    pub failed_values: u64,
}

/// Final report of a simulation
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Configuration the simulation ran with
    pub config: SimulatorConfig,
    /// Collected statistics
    pub stats: SimulationStats,
    /// Violated invariants
    pub violations: Vec<Violation>,
    /// Values in the graph at the end
    pub final_values: usize,
}

impl SimulationReport {
    /// Whether no invariant was violated
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== KV Scheduler Simulation ===");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Operations: {}", self.config.total_operations);
        let _ = writeln!(report, "Transactions: {}", self.stats.transactions);
        let _ = writeln!(report, "Refreshes: {}", self.stats.refreshes);
        let _ = writeln!(report, "Injected failures: {}", self.stats.injected_failures);
        let _ = writeln!(report, "Failed values: {}", self.stats.failed_values);
        let _ = writeln!(report, "Final values: {}", self.final_values);
        if !self.violations.is_empty() {
            let _ = writeln!(report, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. #{} {:?}: {}", i + 1, v.operation_index, v.check, v.details);
            }
        }
        let _ = writeln!(report, "\n=== Result: {} ===", if self.passed() { "PASS" } else { "FAIL" });
        report
    }
}

/// Run the simulator
///
/// # Errors
/// Scheduler construction and shutdown errors; invariant violations are
/// reported, not returned.
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulationReport, SchedulerError> {
    let sb = MockSouthbound::new();
    let mut registry = Registry::new();
    registry.register(MockDescriptor::new("sim", PREFIX, &sb).with_update().with_retrieve())?;
    registry.register(MockDescriptor::new("sim-derived", DERIVED_PREFIX, &sb).with_retrieve())?;
    let scheduler = Scheduler::new(
        SchedulerConfig {
            worker_pool_size: config.worker_pool_size,
            enable_retry: false,
            print_txn_summary: false,
            ..SchedulerConfig::default()
        },
        registry,
    )?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = SimulationStats::default();
    let mut violations = Vec::new();
    let mut requested: BTreeMap<String, MockValue> = BTreeMap::new();

    for i in 0..config.total_operations {
        let operation = generate_operation(&mut rng, &config, &requested);
        debug!(index = i, ?operation, "simulated operation");
        match operation {
            SimulatedOperation::Txn(changes) => {
                let mut txn = scheduler.start_txn().description(format!("sim #{i}"));
                for (key, value) in &changes {
                    txn = match value {
                        Some(value) => txn.put(key.clone(), value.clone()),
                        None => txn.delete(key.clone()),
                    };
                }
                stats.transactions += 1;
                match txn.commit().await {
                    Ok(result) => {
                        stats.failed_values += result.failed_keys().len() as u64;
                        for (key, value) in changes {
                            match value {
                                Some(value) => requested.insert(key, value),
                                None => requested.remove(&key),
                            };
                        }
                    }
                    Err(SchedulerError::DependencyCycle { .. }) => stats.rejected += 1,
                    Err(err) => return Err(err),
                }
            }
            SimulatedOperation::InjectFailure(key) => {
                stats.injected_failures += 1;
                sb.fail_next(&key, 1, false);
            }
            SimulatedOperation::Drift(key) => {
                sb.remove_external(&key);
                stats.refreshes += 1;
                scheduler.refresh(RefreshOptions::all()).await?;
            }
            SimulatedOperation::Refresh => {
                stats.refreshes += 1;
                scheduler.refresh(RefreshOptions::all()).await?;
            }
        }

        let found = check_invariants(&scheduler.graph(), &sb, &requested);
        let stop = !found.is_empty() && config.stop_on_first_violation;
        violations.extend(found.into_iter().map(|(check, details)| Violation {
            operation_index: i,
            check,
            details,
        }));
        if stop {
            break;
        }
    }

    let final_values = scheduler.graph().len();
    scheduler.close();
    info!(seed = config.seed, violations = violations.len(), "simulation finished");
    Ok(SimulationReport {
        config,
        stats,
        violations,
        final_values,
    })
}

fn key_name(index: usize) -> String {
    format!("{PREFIX}k{index:02}")
}

fn generate_operation(
    rng: &mut StdRng,
    config: &SimulatorConfig,
    requested: &BTreeMap<String, MockValue>,
) -> SimulatedOperation {
    let roll: f64 = rng.gen();
    if roll < config.failure_rate && !requested.is_empty() {
        return SimulatedOperation::InjectFailure(pick(rng, requested));
    }
    if roll < config.failure_rate * 2.0 && !requested.is_empty() {
        return SimulatedOperation::Drift(pick(rng, requested));
    }
    if roll > 0.95 {
        return SimulatedOperation::Refresh;
    }

    let batch = rng.gen_range(1..=config.max_batch.max(1));
    let mut changes = Vec::new();
    let mut seen = BTreeSet::new();
    for _ in 0..batch {
        let index = rng.gen_range(0..config.keys.max(1));
        let key = key_name(index);
        if !seen.insert(key.clone()) {
            continue;
        }
        if requested.contains_key(&key) && rng.gen_bool(0.3) {
            changes.push((key, None));
            continue;
        }
        // dependencies only point to lower keys, so no cycles arise
        let mut value = MockValue::new(format!("v{}", rng.gen_range(0..3)));
        for _ in 0..rng.gen_range(0..=2) {
            if index > 0 {
                value = value.depends_on(key_name(rng.gen_range(0..index)));
            }
        }
        value.deps.sort();
        value.deps.dedup();
        if rng.gen_bool(0.2) {
            value = value.derive(format!("{DERIVED_PREFIX}k{index:02}/d"), "derived");
        }
        changes.push((key, Some(value)));
    }
    SimulatedOperation::Txn(changes)
}

fn pick(rng: &mut StdRng, requested: &BTreeMap<String, MockValue>) -> String {
    let index = rng.gen_range(0..requested.len());
    requested.keys().nth(index).cloned().unwrap_or_default()
}

fn check_invariants(
    graph: &GraphSnapshot,
    sb: &Arc<MockSouthbound>,
    requested: &BTreeMap<String, MockValue>,
) -> Vec<(InvariantCheck, String)> {
    let mut found = Vec::new();

    for violation in sb.violations() {
        found.push((InvariantCheck::SouthboundOrdering, violation));
    }

    for node in graph.nodes() {
        let key = node.key();
        match node.state() {
            ValueState::Configured => {
                if !sb.contains(key) {
                    found.push((InvariantCheck::ConfiguredIsPresent, key.to_string()));
                }
                let unmet = graph.unmet_dependencies(node, node.dependencies(), &BTreeSet::new());
                if !unmet.is_empty() {
                    found.push((
                        InvariantCheck::ConfiguredDependenciesMet,
                        format!("{key} missing {}", unmet.join(", ")),
                    ));
                }
            }
            ValueState::Pending => {
                let unmet = graph.unmet_dependencies(node, node.dependencies(), &BTreeSet::new());
                if unmet.is_empty() {
                    found.push((InvariantCheck::PendingHasUnmetDependency, key.to_string()));
                }
            }
            _ => {}
        }
    }

    for key in sb.keys() {
        if graph.get_node(&key).and_then(|n| n.applied_value()).is_none() {
            found.push((InvariantCheck::NoUnknownSouthboundValue, key));
        }
    }

    for (key, value) in requested {
        let intent = graph
            .get_node(key)
            .and_then(|n| n.value())
            .and_then(|v| downcast::<MockValue>(&**v).cloned());
        if intent.as_ref() != Some(value) {
            found.push((
                InvariantCheck::IntentMatchesRequests,
                format!("{key}: requested {value:?}, graph has {intent:?}"),
            ));
        }
    }
    // failed removals keep their node without intent; refresh may adopt them
    // as obtained values
    for node in graph
        .nodes()
        .filter(|n| n.value().is_some() && n.origin() != ValueOrigin::FromSb)
    {
        if node.key().starts_with(PREFIX) && !requested.contains_key(node.key()) {
            found.push((
                InvariantCheck::IntentMatchesRequests,
                format!("{} still in graph after delete", node.key()),
            ));
        }
    }

    found
}
