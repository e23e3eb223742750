//! Scheduler front end and the transaction consumer
//!
//! All transactions, whether NB, SB notifications, retries or refreshes, go
//! through one FIFO queue consumed by a single task. Each transaction works on
//! a private copy of the graph and publishes it atomically on commit, so
//! readers only ever see committed state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::descriptor::{KeySelector, MetadataView, OpContext};
use crate::error::{DescriptorError, KvError, SchedulerError};
use crate::executor::{ExecOptions, Execution, Executor};
use crate::graph::{GraphSnapshot, GraphStore, GraphWriter, Node, ValueState};
use crate::history::{RecordedKv, RecordedTxn, TxnHistory, TxnKind};
use crate::planner::{PlanInput, Planner};
use crate::refresh::{self, RefreshOptions, RefreshReport};
use crate::registry::Registry;
use crate::txn::{sb_notification, KeyResult, QueuedTxn, Txn, TxnHandle, TxnOptions, TxnPayload, TxnResult, ValueStatus};
use crate::value::{describe, ErasedKv, KeyValuePair, MetadataRef, Operation, ValueOrigin, ValueRef};

/// Which state of a descriptor's values to dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Values requested by NB
    Nb,
    /// Values freshly retrieved from the southbound
    Sb,
    /// Values the scheduler believes are in the southbound
    Cached,
}

/// Handle to a running scheduler
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<Registry>,
    graph: GraphStore,
    history: TxnHistory,
    queue: mpsc::Sender<QueuedTxn>,
    status: broadcast::Sender<ValueStatus>,
    shutdown: watch::Sender<bool>,
    /// Held while a transaction runs and while the SB view is dumped
    txn_lock: Mutex<()>,
    permits: Arc<Semaphore>,
    seq: AtomicU64,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("descriptors", &self.inner.registry.names())
            .field("seq", &self.inner.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start the scheduler with a fixed set of descriptors
    ///
    /// # Errors
    /// Invalid configuration, or descriptors whose retrieve dependencies form
    /// a cycle.
    pub fn new(config: SchedulerConfig, registry: Registry) -> Result<Self, SchedulerError> {
        config.validate()?;
        registry.retrieve_order()?;

        let (queue, rx) = mpsc::channel(config.queue_capacity);
        let (status, _) = broadcast::channel(config.status_channel_capacity);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            history: TxnHistory::new(config.transaction_history_limit, config.history_age_limit()),
            permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            registry: Arc::new(registry),
            graph: GraphStore::new(),
            queue,
            status,
            shutdown,
            txn_lock: Mutex::new(()),
            seq: AtomicU64::new(0),
            config,
        });
        info!(descriptors = ?inner.registry.names(), "scheduler started");
        tokio::spawn(consume(Arc::clone(&inner), rx));
        Ok(Self { inner })
    }

    /// Begin an NB transaction
    pub fn start_txn(&self) -> Txn {
        Txn::new(self.clone())
    }

    pub(crate) async fn enqueue(
        &self,
        payload: TxnPayload,
        options: TxnOptions,
    ) -> Result<TxnHandle, SchedulerError> {
        if *self.inner.shutdown.borrow() {
            return Err(SchedulerError::Closed);
        }
        let (queued, handle) = QueuedTxn::new(payload, options);
        self.inner
            .queue
            .send(queued)
            .await
            .map_err(|_| SchedulerError::Closed)?;
        Ok(handle)
    }

    /// Re-read the southbound and reconcile the graph with it
    ///
    /// # Errors
    /// [`SchedulerError::Closed`] after shutdown, registry errors.
    pub async fn refresh(&self, opts: RefreshOptions) -> Result<TxnResult, SchedulerError> {
        self.enqueue(TxnPayload::Refresh(opts), TxnOptions::default())
            .await?
            .result()
            .await
    }

    /// Report a value appearing in (`Some`) or vanishing from (`None`) the
    /// southbound on its own
    ///
    /// # Errors
    /// [`SchedulerError::Closed`] after shutdown.
    pub async fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<ValueRef>,
        metadata: Option<MetadataRef>,
    ) -> Result<TxnHandle, SchedulerError> {
        self.enqueue(sb_notification(key.into(), value, metadata), TxnOptions::default())
            .await
    }

    /// Last committed graph
    #[must_use]
    pub fn graph(&self) -> Arc<GraphSnapshot> {
        self.inner.graph.snapshot()
    }

    /// Intended value of a key (or the obtained value for SB-only keys)
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<ValueRef> {
        self.graph().get_node(key).and_then(|n| n.value().cloned())
    }

    /// Values whose key passes the selector
    #[must_use]
    pub fn get_values(&self, selector: impl Fn(&str) -> bool) -> Vec<KeyValuePair> {
        self.collect_values(|node| selector(node.key()))
    }

    /// Values waiting for dependencies
    #[must_use]
    pub fn get_pending_values(&self, selector: impl Fn(&str) -> bool) -> Vec<KeyValuePair> {
        self.collect_values(|node| node.state() == ValueState::Pending && selector(node.key()))
    }

    /// Errors of values in a failure state
    #[must_use]
    pub fn get_failed_values(&self, selector: impl Fn(&str) -> bool) -> BTreeMap<String, KvError> {
        self.graph()
            .nodes()
            .filter(|node| node.state().is_failure() && selector(node.key()))
            .filter_map(|node| node.error().map(|err| (node.key().to_string(), err.clone())))
            .collect()
    }

    fn collect_values(&self, filter: impl Fn(&Node) -> bool) -> Vec<KeyValuePair> {
        self.graph()
            .nodes()
            .filter(|node| filter(node))
            .filter_map(|node| {
                node.value().map(|value| KeyValuePair {
                    key: node.key().to_string(),
                    value: Arc::clone(value),
                })
            })
            .collect()
    }

    /// Current status of `key`
    #[must_use]
    pub fn value_status(&self, key: &str) -> ValueStatus {
        ValueStatus::of(&self.graph(), key, None)
    }

    /// Status updates of every value touched by later transactions
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<ValueStatus> {
        self.inner.status.subscribe()
    }

    /// Values of one descriptor
    ///
    /// # Errors
    /// [`SchedulerError::UnknownDescriptor`]; for [`View::Sb`] also retrieve
    /// failures.
    pub async fn dump_values_by_descriptor(
        &self,
        descriptor: &str,
        view: View,
    ) -> Result<Vec<ErasedKv>, SchedulerError> {
        let kv_descriptor = self
            .inner
            .registry
            .get(descriptor)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownDescriptor(descriptor.to_string()))?;

        let erased = |node: &Node, value: &ValueRef| ErasedKv {
            key: node.key().to_string(),
            value: Arc::clone(value),
            metadata: node.metadata().cloned(),
            origin: node.origin(),
        };

        match view {
            View::Nb => Ok(self
                .graph()
                .nodes_by_descriptor(descriptor)
                .filter(|node| node.origin() == ValueOrigin::FromNb)
                .filter_map(|node| node.value().map(|value| erased(node, value)))
                .collect()),
            View::Cached => Ok(self
                .graph()
                .nodes_by_descriptor(descriptor)
                .filter_map(|node| node.applied_value().map(|value| erased(node, value)))
                .collect()),
            View::Sb => {
                let _guard = self.inner.txn_lock.lock().await;
                let graph = self.graph();
                let correlate: Vec<ErasedKv> = graph
                    .nodes_by_descriptor(descriptor)
                    .filter(|node| node.origin() == ValueOrigin::FromNb)
                    .filter_map(|node| {
                        node.value().map(|value| ErasedKv {
                            metadata: node.metadata.clone(),
                            ..erased(node, value)
                        })
                    })
                    .collect();
                let ctx = OpContext::new(Arc::clone(&graph), graph.seq());
                let values = tokio::task::spawn_blocking(move || kv_descriptor.retrieve(&ctx, &correlate))
                    .await
                    .map_err(|err| DescriptorError::Failed(format!("retrieve aborted: {err}")))??;
                Ok(values)
            }
        }
    }

    /// Metadata of a descriptor's values, read-only
    #[must_use]
    pub fn metadata_view<M: std::any::Any + Clone>(&self, descriptor: &str) -> MetadataView<M> {
        MetadataView::from_graph(&self.graph(), descriptor)
    }

    /// Key prefixes under which NB values are expected
    #[must_use]
    pub fn registered_nb_prefixes(&self) -> Vec<String> {
        self.inner.registry.nb_key_prefixes()
    }

    /// Recorded transactions, oldest first
    #[must_use]
    pub fn transaction_history(&self) -> Vec<RecordedTxn> {
        self.inner.history.all()
    }

    /// Recorded transaction by sequence number
    #[must_use]
    pub fn recorded_txn(&self, seq: u64) -> Option<RecordedTxn> {
        self.inner.history.get(seq)
    }

    /// Registered descriptors
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Configuration the scheduler runs with
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Stop accepting transactions; queued ones fail with
    /// [`SchedulerError::Closed`]
    pub fn close(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("scheduler closing");
        }
    }

    /// Whether [`Scheduler::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

/// Selector matching keys under a prefix
#[must_use]
pub fn with_prefix(prefix: impl Into<String>) -> KeySelector {
    let prefix = prefix.into();
    Arc::new(move |key: &str| key.starts_with(&prefix))
}

async fn consume(inner: Arc<Inner>, mut rx: mpsc::Receiver<QueuedTxn>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = inner.config.refresh_interval().map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Some(txn) => inner.process(txn).await,
                None => break,
            },
            () = tick(ticker.as_mut()) => {
                debug!("periodic refresh");
                inner
                    .process(QueuedTxn::internal(TxnPayload::Refresh(RefreshOptions::all())))
                    .await;
            }
        }
    }

    rx.close();
    while let Ok(mut txn) = rx.try_recv() {
        txn.respond(Err(SchedulerError::Closed));
    }
    info!("scheduler stopped");
}

async fn tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Inner {
    async fn process(&self, mut txn: QueuedTxn) {
        if !txn.start() {
            debug!(kind = ?txn.payload.kind(), "skipping cancelled transaction");
            txn.respond(Err(SchedulerError::Cancelled));
            return;
        }
        let _guard = self.txn_lock.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let kind = txn.payload.kind();
        let span = info_span!("txn", seq, kind = ?kind);
        let payload = std::mem::replace(&mut txn.payload, TxnPayload::Nb(Vec::new()));
        let result = self.execute(seq, payload, &txn.options).instrument(span).await;
        txn.respond(result);
    }

    async fn execute(
        &self,
        seq: u64,
        payload: TxnPayload,
        options: &TxnOptions,
    ) -> Result<TxnResult, SchedulerError> {
        let start = Utc::now();
        let kind = payload.kind();
        let mut writer = self.graph.begin();

        let (inputs, refresh_report) = match self.preprocess(&mut writer, seq, payload).await {
            Ok(prepared) => prepared,
            Err(err) => {
                self.record_rejected(seq, kind, options, start, Vec::new(), &err);
                return Err(err);
            }
        };
        let recorded = recorded_values(&inputs);
        let requested: BTreeSet<String> = inputs.iter().map(|i| i.key().to_string()).collect();
        let originals: Vec<PlanInput> = if options.revert_on_failure && kind == TxnKind::NbTransaction {
            revert_inputs(writer.base(), &requested)
        } else {
            Vec::new()
        };

        let plan = match Planner::new(&self.registry).plan(&writer, inputs) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(seq, error = %err, "transaction rejected");
                self.record_rejected(seq, kind, options, start, recorded, &err);
                return Err(err);
            }
        };
        let planned = plan.ops().to_vec();

        let exec = ExecOptions {
            dry_run: options.dry_run,
            retry: match kind {
                TxnKind::SbNotification => None,
                _ => options.retry.or_else(|| self.config.default_retry()),
            },
            is_retry: kind == TxnKind::RetryFailedOps,
            is_revert: false,
        };
        let mut execution = Executor::new(&self.registry, Arc::clone(&self.permits), seq, exec.clone())
            .run(&mut writer, plan)
            .await;

        let failures: BTreeMap<String, KvError> = requested
            .iter()
            .filter_map(|key| writer.get_node(key))
            .filter(|n| n.state().is_failure())
            .filter_map(|n| n.error().map(|err| (n.key().to_string(), err.clone())))
            .collect();
        let reverted = !failures.is_empty() && !originals.is_empty();
        if reverted {
            info!(seq, failed = failures.len(), "reverting transaction");
            self.revert(&mut writer, seq, originals, &exec, &mut execution).await;
        }

        let final_graph = writer.freeze();
        if !options.dry_run {
            self.graph.commit(writer, seq);
            self.schedule_retries(&final_graph, &execution);
        }

        let mut values = BTreeMap::new();
        for key in requested.iter().chain(execution.touched.keys()) {
            let last = execution.touched.get(key).copied().flatten();
            let status = self.status_of(&final_graph, key, last, execution.touched.contains_key(key));
            values.insert(
                key.clone(),
                KeyResult {
                    key: key.clone(),
                    state: status.state,
                    operation: last,
                    error: status.error,
                },
            );
        }

        // reverted values still report why the transaction was undone
        if reverted {
            for (key, err) in failures {
                if let Some(entry) = values.get_mut(&key) {
                    entry.error.get_or_insert(err);
                }
            }
        }

        let result = TxnResult {
            seq,
            kind,
            values,
            planned,
            executed: execution.ops,
            refresh: refresh_report,
            dry_run: options.dry_run,
        };
        self.record_result(&result, options, start, recorded);

        if !options.dry_run {
            for (key, last) in &execution.touched {
                let status = self.status_of(&final_graph, key, *last, true);
                let _ = self.status.send(status);
            }
        }
        Ok(result)
    }

    /// Turn the payload into plan inputs
    async fn preprocess(
        &self,
        writer: &mut GraphWriter,
        seq: u64,
        payload: TxnPayload,
    ) -> Result<(Vec<PlanInput>, Option<RefreshReport>), SchedulerError> {
        match payload {
            TxnPayload::Nb(inputs) => Ok((inputs, None)),
            TxnPayload::Sb(inputs) => {
                let inputs = inputs
                    .into_iter()
                    .filter(|input| {
                        let nb_managed = writer
                            .get_node(input.key())
                            .is_some_and(|n| n.origin() != ValueOrigin::FromSb && n.value().is_some());
                        if nb_managed {
                            debug!(seq, key = input.key(), "ignoring SB notification for NB value");
                        }
                        !nb_managed
                    })
                    .collect();
                Ok((inputs, None))
            }
            TxnPayload::Retry(keys) => {
                let inputs = keys
                    .into_iter()
                    .filter(|(key, intent_seq)| {
                        let current = writer.get_node(key).is_some_and(|n| {
                            n.intent_seq == *intent_seq && n.state() == ValueState::Retrying
                        });
                        if !current {
                            debug!(seq, key = %key, "dropping obsolete retry");
                        }
                        current
                    })
                    .map(|(key, _)| PlanInput::Reapply { key })
                    .collect();
                Ok((inputs, None))
            }
            TxnPayload::Refresh(opts) => {
                let strict = opts.strict.unwrap_or(self.config.strict_refresh);
                let (report, inputs) =
                    refresh::reconcile(&self.registry, writer, seq, &opts, strict).await?;
                Ok((inputs, Some(report)))
            }
        }
    }

    async fn revert(
        &self,
        writer: &mut GraphWriter,
        seq: u64,
        originals: Vec<PlanInput>,
        exec: &ExecOptions,
        execution: &mut Execution,
    ) {
        let plan = match Planner::new(&self.registry).plan(writer, originals) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(seq, error = %err, "revert could not be planned");
                return;
            }
        };
        let opts = ExecOptions {
            retry: None,
            is_revert: true,
            ..exec.clone()
        };
        let reverted = Executor::new(&self.registry, Arc::clone(&self.permits), seq, opts)
            .run(writer, plan)
            .await;
        execution.ops.extend(reverted.ops);
        for (key, op) in reverted.touched {
            let last = execution.touched.entry(key).or_insert(None);
            if op.is_some() {
                *last = op;
            }
        }
    }

    /// Queue retries of values left in the retrying state, grouped by delay
    fn schedule_retries(&self, graph: &GraphSnapshot, execution: &Execution) {
        let mut groups: BTreeMap<Duration, BTreeMap<String, u64>> = BTreeMap::new();
        for key in execution.touched.keys() {
            let Some(node) = graph.get_node(key) else { continue };
            if node.state() != ValueState::Retrying {
                continue;
            }
            let Some(policy) = node.retry else { continue };
            groups
                .entry(policy.delay(node.attempts()))
                .or_default()
                .insert(key.clone(), node.intent_seq);
        }

        for (delay, keys) in groups {
            debug!(?delay, keys = ?keys.keys().collect::<Vec<_>>(), "retry scheduled");
            let queue = self.queue.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {
                        let _ = queue.send(QueuedTxn::internal(TxnPayload::Retry(keys))).await;
                    }
                    _ = shutdown.changed() => {}
                }
            });
        }
    }

    fn status_of(&self, graph: &GraphSnapshot, key: &str, last: Option<Operation>, touched: bool) -> ValueStatus {
        let mut status = ValueStatus::of(graph, key, last);
        if touched && graph.get_node(key).is_none() {
            status.state = ValueState::Removed;
        }
        status
    }

    fn record_result(
        &self,
        result: &TxnResult,
        options: &TxnOptions,
        start: chrono::DateTime<Utc>,
        values: Vec<RecordedKv>,
    ) {
        let txn = RecordedTxn {
            seq: result.seq,
            kind: result.kind,
            description: options.description.clone(),
            start,
            stop: Utc::now(),
            values,
            planned: result.planned.clone(),
            executed: result.executed.clone(),
            error: None,
        };
        self.store(txn);
    }

    /// Record a transaction that failed before execution
    fn record_rejected(
        &self,
        seq: u64,
        kind: TxnKind,
        options: &TxnOptions,
        start: chrono::DateTime<Utc>,
        values: Vec<RecordedKv>,
        error: &SchedulerError,
    ) {
        let txn = RecordedTxn {
            seq,
            kind,
            description: options.description.clone(),
            start,
            stop: Utc::now(),
            values,
            planned: Vec::new(),
            executed: Vec::new(),
            error: Some(error.to_string()),
        };
        self.store(txn);
    }

    fn store(&self, txn: RecordedTxn) {
        if self.config.print_txn_summary {
            info!("{}", txn.summary());
        }
        if self.config.record_transaction_history {
            self.history.push(txn);
        }
    }
}

fn recorded_values(inputs: &[PlanInput]) -> Vec<RecordedKv> {
    inputs
        .iter()
        .map(|input| RecordedKv {
            key: input.key().to_string(),
            value: match input {
                PlanInput::Put { value, .. } => Some(describe(&**value)),
                PlanInput::Delete { .. } | PlanInput::Reapply { .. } => None,
            },
        })
        .collect()
}

/// Inputs restoring the committed NB values of `keys`
fn revert_inputs(base: &GraphSnapshot, keys: &BTreeSet<String>) -> Vec<PlanInput> {
    keys.iter()
        .map(|key| {
            match base
                .get_node(key)
                .filter(|n| n.origin() == ValueOrigin::FromNb && !n.is_derived())
                .and_then(|n| n.value())
            {
                Some(value) => PlanInput::put(key.clone(), Arc::clone(value)),
                None => PlanInput::delete(key.clone()),
            }
        })
        .collect()
}
