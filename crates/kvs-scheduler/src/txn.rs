//! Transactions: builder, handle and results

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{KvError, SchedulerError};
use crate::graph::{GraphSnapshot, ValueState};
use crate::history::{RecordedOp, TxnKind};
use crate::planner::{PlanInput, PlannedOp};
use crate::refresh::{RefreshOptions, RefreshReport};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::value::{value_ref, MetadataRef, Operation, Value, ValueOrigin, ValueRef};

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Per-transaction options
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Free-form description kept in history
    pub description: Option<String>,
    /// Overrides the configured retry policy for this transaction's values
    pub retry: Option<RetryPolicy>,
    /// Re-apply the previous values of all keys if any of them fails
    pub revert_on_failure: bool,
    /// Plan and simulate without touching the southbound
    pub dry_run: bool,
    /// How long `commit` waits for values left pending
    pub deadline: Option<Duration>,
}

/// Work item of the transaction queue
#[derive(Debug)]
pub(crate) enum TxnPayload {
    Nb(Vec<PlanInput>),
    Sb(Vec<PlanInput>),
    /// Keys to retry with the intent sequence they failed with
    Retry(BTreeMap<String, u64>),
    Refresh(RefreshOptions),
}

impl TxnPayload {
    pub(crate) fn kind(&self) -> TxnKind {
        match self {
            Self::Nb(_) => TxnKind::NbTransaction,
            Self::Sb(_) => TxnKind::SbNotification,
            Self::Retry(_) => TxnKind::RetryFailedOps,
            Self::Refresh(_) => TxnKind::Refresh,
        }
    }
}

pub(crate) struct QueuedTxn {
    pub(crate) payload: TxnPayload,
    pub(crate) options: TxnOptions,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) reply: Option<oneshot::Sender<Result<TxnResult, SchedulerError>>>,
}

impl QueuedTxn {
    pub(crate) fn new(payload: TxnPayload, options: TxnOptions) -> (Self, TxnHandle) {
        let state = Arc::new(AtomicU8::new(QUEUED));
        let (tx, rx) = oneshot::channel();
        let queued = Self {
            payload,
            options,
            state: Arc::clone(&state),
            reply: Some(tx),
        };
        (queued, TxnHandle { state, reply: rx })
    }

    /// Transaction nobody waits for (retries, periodic refresh)
    pub(crate) fn internal(payload: TxnPayload) -> Self {
        Self {
            payload,
            options: TxnOptions::default(),
            state: Arc::new(AtomicU8::new(QUEUED)),
            reply: None,
        }
    }

    /// Claim the transaction for execution; false when it was cancelled
    pub(crate) fn start(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn respond(&mut self, result: Result<TxnResult, SchedulerError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl std::fmt::Debug for QueuedTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTxn")
            .field("kind", &self.payload.kind())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Handle to a submitted transaction
#[derive(Debug)]
pub struct TxnHandle {
    state: Arc<AtomicU8>,
    reply: oneshot::Receiver<Result<TxnResult, SchedulerError>>,
}

impl TxnHandle {
    /// Cancel the transaction if it has not started yet
    ///
    /// Returns false once execution has begun; the transaction then runs to
    /// completion.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wait for the transaction to finish
    ///
    /// # Errors
    /// [`SchedulerError::Cancelled`], [`SchedulerError::Closed`] or a planning
    /// error such as [`SchedulerError::DependencyCycle`].
    pub async fn result(self) -> Result<TxnResult, SchedulerError> {
        self.reply.await.map_err(|_| SchedulerError::Closed)?
    }
}

/// Outcome for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyResult {
    /// Key of the value
    pub key: String,
    /// State after the transaction
    pub state: ValueState,
    /// Last southbound operation performed on the key
    pub operation: Option<Operation>,
    /// Error that left the value unconfigured
    pub error: Option<KvError>,
}

/// Outcome of a transaction
#[derive(Debug, Clone, Serialize)]
pub struct TxnResult {
    /// Sequence number of the transaction
    pub seq: u64,
    /// Kind of transaction
    pub kind: TxnKind,
    /// Requested and affected keys
    pub values: BTreeMap<String, KeyResult>,
    /// Planned steps
    pub planned: Vec<PlannedOp>,
    /// Steps as executed
    pub executed: Vec<RecordedOp>,
    /// Report of a refresh transaction
    pub refresh: Option<RefreshReport>,
    /// Whether southbound calls were only simulated
    pub dry_run: bool,
}

impl TxnResult {
    /// State of `key` after the transaction
    #[must_use]
    pub fn state(&self, key: &str) -> Option<ValueState> {
        self.values.get(key).map(|r| r.state)
    }

    /// Error reported for `key`
    #[must_use]
    pub fn error(&self, key: &str) -> Option<&KvError> {
        self.values.get(key).and_then(|r| r.error.as_ref())
    }

    /// Keys that ended with an error
    #[must_use]
    pub fn failed_keys(&self) -> Vec<&str> {
        self.values
            .values()
            .filter(|r| r.error.is_some())
            .map(|r| r.key.as_str())
            .collect()
    }

    /// Whether no key reported an error
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.values.values().all(|r| r.error.is_none())
    }

    /// Keys on which the given operation was executed, in execution order
    #[must_use]
    pub fn operations(&self, operation: Operation) -> Vec<&str> {
        self.executed
            .iter()
            .filter(|op| op.operation == Some(operation) && !op.new_state.is_failure())
            .map(|op| op.key.as_str())
            .collect()
    }
}

/// Current status of one value, broadcast after every transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueStatus {
    /// Key of the value
    pub key: String,
    /// Current state
    pub state: ValueState,
    /// Where the value came from
    pub origin: ValueOrigin,
    /// Owning descriptor
    pub descriptor: Option<String>,
    /// Error of the last attempt
    pub error: Option<KvError>,
    /// Last southbound operation on the value
    pub last_operation: Option<Operation>,
    /// Transaction that last changed the value
    pub txn_seq: u64,
}

impl ValueStatus {
    pub(crate) fn of(graph: &GraphSnapshot, key: &str, last_operation: Option<Operation>) -> Self {
        match graph.get_node(key) {
            Some(node) => Self {
                key: key.to_string(),
                state: node.state(),
                origin: node.origin(),
                descriptor: node.descriptor().map(str::to_string),
                error: node.error().cloned(),
                last_operation,
                txn_seq: node.last_update(),
            },
            None => Self {
                key: key.to_string(),
                state: if last_operation.is_some() {
                    ValueState::Removed
                } else {
                    ValueState::NonExistent
                },
                origin: ValueOrigin::Unknown,
                descriptor: None,
                error: None,
                last_operation,
                txn_seq: graph.seq(),
            },
        }
    }
}

/// NB transaction builder
#[derive(Debug)]
#[must_use = "a transaction does nothing until committed"]
pub struct Txn {
    scheduler: Scheduler,
    inputs: Vec<PlanInput>,
    options: TxnOptions,
}

impl Txn {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            inputs: Vec::new(),
            options: TxnOptions::default(),
        }
    }

    /// Set `key` to `value`
    pub fn put<V: Value>(self, key: impl Into<String>, value: V) -> Self {
        self.put_value(key, value_ref(value))
    }

    /// Set `key` to an already type-erased value
    pub fn put_value(mut self, key: impl Into<String>, value: ValueRef) -> Self {
        self.inputs.push(PlanInput::put(key, value));
        self
    }

    /// Remove `key`
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(PlanInput::delete(key));
        self
    }

    /// Replace all options
    pub fn with_options(mut self, options: TxnOptions) -> Self {
        self.options = options;
        self
    }

    /// Description kept in history
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.options.description = Some(description.into());
        self
    }

    /// Retry policy for this transaction's values
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    /// Restore previous values if any value fails
    pub fn revert_on_failure(mut self) -> Self {
        self.options.revert_on_failure = true;
        self
    }

    /// Plan and simulate without southbound calls
    pub fn dry_run(mut self) -> Self {
        self.options.dry_run = true;
        self
    }

    /// Wait up to `deadline` for values left pending
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    /// Whether the transaction has no changes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Queue the transaction
    ///
    /// # Errors
    /// [`SchedulerError::Closed`] after shutdown.
    pub async fn submit(self) -> Result<TxnHandle, SchedulerError> {
        self.scheduler
            .enqueue(TxnPayload::Nb(self.inputs), self.options)
            .await
    }

    /// Queue the transaction and wait for its result
    ///
    /// With a deadline, keys left pending are awaited until they converge or
    /// the deadline passes; those still pending are reported with
    /// [`KvError::DependencyUnmet`].
    ///
    /// # Errors
    /// Same as [`TxnHandle::result`].
    pub async fn commit(self) -> Result<TxnResult, SchedulerError> {
        let deadline = self.options.deadline;
        let scheduler = self.scheduler.clone();
        let statuses = scheduler.subscribe_status();
        let mut result = self.submit().await?.result().await?;
        if let Some(deadline) = deadline {
            if !result.dry_run {
                wait_for_pending(&scheduler, statuses, &mut result, deadline).await;
            }
        }
        Ok(result)
    }
}

async fn wait_for_pending(
    scheduler: &Scheduler,
    mut statuses: broadcast::Receiver<ValueStatus>,
    result: &mut TxnResult,
    deadline: Duration,
) {
    let mut pending: BTreeSet<String> = result
        .values
        .values()
        .filter(|r| r.state == ValueState::Pending)
        .map(|r| r.key.clone())
        .collect();
    let until = Instant::now() + deadline;

    while !pending.is_empty() {
        match tokio::time::timeout_at(until, statuses.recv()).await {
            Ok(Ok(status)) => {
                if pending.contains(&status.key) && status.state != ValueState::Pending {
                    pending.remove(&status.key);
                    debug!(key = %status.key, state = ?status.state, "pending value settled");
                    settle(result, status);
                }
            }
            // lagged subscribers re-read the graph instead
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                let graph = scheduler.graph();
                let settled: Vec<String> = pending
                    .iter()
                    .filter(|key| !graph.get_node(key).is_some_and(|n| n.state() == ValueState::Pending))
                    .cloned()
                    .collect();
                for key in settled {
                    pending.remove(&key);
                    settle(result, ValueStatus::of(&graph, &key, None));
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }

    let graph = scheduler.graph();
    for key in pending {
        let missing = graph
            .get_node(&key)
            .map(|node| graph.unmet_dependencies(node, node.dependencies(), &BTreeSet::new()))
            .unwrap_or_default();
        if let Some(entry) = result.values.get_mut(&key) {
            entry.error = Some(KvError::DependencyUnmet {
                key: key.clone(),
                missing,
            });
        }
    }
}

fn settle(result: &mut TxnResult, status: ValueStatus) {
    let operation = status
        .last_operation
        .or_else(|| result.values.get(&status.key).and_then(|r| r.operation));
    result.values.insert(
        status.key.clone(),
        KeyResult {
            key: status.key,
            state: status.state,
            operation,
            error: status.error,
        },
    );
}

/// Build an SB notification payload
pub(crate) fn sb_notification(
    key: String,
    value: Option<ValueRef>,
    metadata: Option<MetadataRef>,
) -> TxnPayload {
    let input = match value {
        Some(value) => PlanInput::Put {
            key,
            value,
            origin: ValueOrigin::FromSb,
            metadata,
        },
        None => PlanInput::Delete { key },
    };
    TxnPayload::Sb(vec![input])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_result(key: &str, state: ValueState, error: Option<KvError>) -> KeyResult {
        KeyResult {
            key: key.to_string(),
            state,
            operation: None,
            error,
        }
    }

    fn executed(key: &str, operation: Operation, new_state: ValueState) -> RecordedOp {
        RecordedOp {
            key: key.to_string(),
            operation: Some(operation),
            prev_state: ValueState::Pending,
            new_state,
            prev_value: None,
            new_value: None,
            error: None,
            derived: false,
            is_retry: false,
            is_revert: false,
            dry_run: false,
        }
    }

    fn result(values: Vec<KeyResult>, ops: Vec<RecordedOp>) -> TxnResult {
        TxnResult {
            seq: 1,
            kind: TxnKind::NbTransaction,
            values: values.into_iter().map(|r| (r.key.clone(), r)).collect(),
            planned: Vec::new(),
            executed: ops,
            refresh: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_failed_keys() {
        let err = KvError::Unimplemented { key: "b".into() };
        let res = result(
            vec![
                key_result("a", ValueState::Configured, None),
                key_result("b", ValueState::Unimplemented, Some(err.clone())),
            ],
            Vec::new(),
        );

        assert!(!res.is_success());
        assert_eq!(res.failed_keys(), vec!["b"]);
        assert_eq!(res.error("b"), Some(&err));
        assert_eq!(res.state("a"), Some(ValueState::Configured));
        assert_eq!(res.state("c"), None);
    }

    #[test]
    fn test_operations_skip_failed_attempts() {
        let res = result(
            Vec::new(),
            vec![
                executed("a", Operation::Create, ValueState::Retrying),
                executed("b", Operation::Create, ValueState::Configured),
                executed("a", Operation::Create, ValueState::Configured),
                executed("c", Operation::Delete, ValueState::Removed),
            ],
        );

        assert_eq!(res.operations(Operation::Create), vec!["b", "a"]);
        assert_eq!(res.operations(Operation::Delete), vec!["c"]);
        assert!(res.operations(Operation::Update).is_empty());
    }

    #[test]
    fn test_cancel_only_before_start() {
        let (_tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(QUEUED));
        let handle = TxnHandle {
            state: Arc::clone(&state),
            reply: rx,
        };
        assert!(handle.cancel());
        assert_eq!(state.load(Ordering::Acquire), CANCELLED);

        state.store(STARTED, Ordering::Release);
        assert!(!handle.cancel());
    }
}
