//! Plan executor
//!
//! Steps are queued per key (FIFO) and run in waves. A wave holds every key
//! whose head step is not waiting on another key's queued steps; removals go
//! before applies. Within a wave descriptor callbacks run concurrently on a
//! bounded blocking pool, then their results are applied in key order.
//! Successful creates wake pending dependents and derive child values; failed
//! values tear down whatever relied on them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::descriptor::{KvDescriptor, OpContext};
use crate::error::{DescriptorError, KvError};
use crate::graph::{GraphSnapshot, GraphWriter, Node, ValueState};
use crate::history::RecordedOp;
use crate::planner::{Plan, StepAction};
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::value::{describe, MetadataRef, Operation, ValueOrigin, ValueRef};

/// Upper bound of steps processed for one key within a transaction
const MAX_KEY_VISITS: u32 = 64;

#[derive(Debug, Clone, Default)]
pub(crate) struct ExecOptions {
    pub(crate) dry_run: bool,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) is_retry: bool,
    pub(crate) is_revert: bool,
}

/// Outcome of running a plan
#[derive(Debug, Default)]
pub(crate) struct Execution {
    pub(crate) ops: Vec<RecordedOp>,
    /// Keys whose node changed, with the last southbound operation
    pub(crate) touched: BTreeMap<String, Option<Operation>>,
}

#[derive(Debug)]
struct QueuedStep {
    ticket: u64,
    action: StepAction,
    after: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Value goes away
    Remove,
    /// Dependency lost; intent is kept and the value waits
    Unconfigure,
    /// Delete before re-creating with the new value
    Recreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Create,
    Update,
    Delete(Teardown),
}

#[derive(Debug, Clone)]
struct Prev {
    state: ValueState,
    value: Option<ValueRef>,
}

#[derive(Clone)]
struct PendingCall {
    key: String,
    kind: CallKind,
    descriptor: Arc<dyn KvDescriptor>,
    /// New value for create/update, southbound value for delete
    value: ValueRef,
    old: Option<ValueRef>,
    metadata: Option<MetadataRef>,
    prev: Prev,
}

impl PendingCall {
    fn operation(&self) -> Operation {
        match self.kind {
            CallKind::Create => Operation::Create,
            CallKind::Update => Operation::Update,
            CallKind::Delete(_) => Operation::Delete,
        }
    }

    fn invoke(&self, ctx: &OpContext) -> Result<Option<MetadataRef>, DescriptorError> {
        match self.kind {
            CallKind::Create => self.descriptor.create(ctx, &self.key, &self.value).map(Some),
            CallKind::Update => {
                let old = self.old.as_ref().unwrap_or(&self.value);
                self.descriptor
                    .update(ctx, &self.key, old, &self.value, self.metadata.as_ref())
                    .map(Some)
            }
            CallKind::Delete(_) => self
                .descriptor
                .delete(ctx, &self.key, &self.value, self.metadata.as_ref())
                .map(|()| None),
        }
    }
}

enum Prepared {
    Call(PendingCall),
    Done,
    /// Keys that must be handled first
    Blocked(BTreeSet<String>),
}

pub(crate) struct Executor<'a> {
    registry: &'a Registry,
    permits: Arc<Semaphore>,
    seq: u64,
    opts: ExecOptions,
    queue: BTreeMap<String, VecDeque<QueuedStep>>,
    next_ticket: u64,
    visits: BTreeMap<String, u32>,
    in_flight: BTreeMap<String, CallKind>,
    /// Keys waiting for dependents before their own teardown
    tearing_down: BTreeSet<String>,
    out: Execution,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        permits: Arc<Semaphore>,
        seq: u64,
        opts: ExecOptions,
    ) -> Self {
        Self {
            registry,
            permits,
            seq,
            opts,
            queue: BTreeMap::new(),
            next_ticket: 0,
            visits: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            tearing_down: BTreeSet::new(),
            out: Execution::default(),
        }
    }

    pub(crate) async fn run(mut self, graph: &mut GraphWriter, plan: Plan) -> Execution {
        for step in plan.steps {
            self.push_back(&step.key, step.action, step.after);
        }

        while let Some(wave) = self.next_wave() {
            trace!(seq = self.seq, wave = ?wave, "executing wave");
            let mut calls = Vec::new();
            for key in wave {
                if let Some(call) = self.prepare(graph, &key) {
                    self.in_flight.insert(call.key.clone(), call.kind);
                    calls.push(call);
                }
            }
            if !calls.is_empty() {
                let ctx = OpContext::new(graph.freeze(), self.seq);
                for (call, result) in self.invoke(ctx, calls).await {
                    self.complete(graph, call, result);
                }
            }
            self.in_flight.clear();
        }
        self.out
    }

    fn push_back(&mut self, key: &str, action: StepAction, after: BTreeSet<String>) {
        let ticket = self.take_ticket();
        self.queue
            .entry(key.to_string())
            .or_default()
            .push_back(QueuedStep {
                ticket,
                action,
                after,
            });
    }

    fn take_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    /// Queue a follow-up step unless an equivalent one is already last in line
    fn enqueue(&mut self, key: &str, action: StepAction) {
        if let Some(last) = self.queue.get(key).and_then(VecDeque::back) {
            let same = match (&last.action, &action) {
                (StepAction::Remove, StepAction::Remove)
                | (StepAction::Unconfigure, StepAction::Unconfigure)
                | (StepAction::Reapply, StepAction::Reapply)
                | (StepAction::Apply { .. }, StepAction::Reapply) => true,
                _ => false,
            };
            if same {
                return;
            }
        }
        self.push_back(key, action, BTreeSet::new());
    }

    fn next_wave(&mut self) -> Option<Vec<String>> {
        self.queue.retain(|_, steps| !steps.is_empty());
        if self.queue.is_empty() {
            return None;
        }

        let mut eligible: Vec<(String, u8)> = Vec::new();
        for (key, steps) in &self.queue {
            let Some(head) = steps.front() else { continue };
            let waiting = head
                .after
                .iter()
                .any(|k| k != key && self.queue.contains_key(k));
            if !waiting {
                eligible.push((key.clone(), head.action.phase()));
            }
        }

        if eligible.is_empty() {
            let (key, ticket) = self
                .queue
                .iter()
                .filter_map(|(k, steps)| steps.front().map(|s| (k.clone(), s.ticket)))
                .min_by_key(|(_, ticket)| *ticket)?;
            warn!(seq = self.seq, key = %key, ticket, "ordering deadlock, forcing step");
            if let Some(head) = self.queue.get_mut(&key).and_then(VecDeque::front_mut) {
                head.after.clear();
            }
            return Some(vec![key]);
        }

        let min_phase = eligible.iter().map(|(_, phase)| *phase).min().unwrap_or(0);
        Some(
            eligible
                .into_iter()
                .filter(|(_, phase)| *phase == min_phase)
                .map(|(key, _)| key)
                .collect(),
        )
    }

    fn prepare(&mut self, graph: &mut GraphWriter, key: &str) -> Option<PendingCall> {
        let visits = self.visits.entry(key.to_string()).or_default();
        *visits += 1;
        if *visits > MAX_KEY_VISITS {
            warn!(seq = self.seq, key, "too many steps for key, dropping the rest");
            self.give_up(graph, key);
            return None;
        }

        let action = self.queue.get(key)?.front()?.action.clone();
        let prev = Prev {
            state: graph
                .get_node(key)
                .map_or(ValueState::NonExistent, |n| n.state()),
            value: graph.get_node(key).and_then(|n| n.value().cloned()),
        };

        let prepared = match &action {
            StepAction::Apply {
                value,
                origin,
                metadata,
                derived_from,
            } => {
                self.set_intent(graph, key, value, *origin, metadata.clone(), derived_from.clone());
                self.converge(graph, key, &prev)
            }
            StepAction::Reapply => self.converge(graph, key, &prev),
            StepAction::Remove => self.teardown(graph, key, Teardown::Remove, &prev),
            StepAction::Unconfigure => self.teardown(graph, key, Teardown::Unconfigure, &prev),
        };

        match prepared {
            Prepared::Blocked(blockers) => {
                debug!(seq = self.seq, key, ?blockers, "step deferred");
                self.tearing_down.insert(key.to_string());
                if let Some(head) = self.queue.get_mut(key).and_then(VecDeque::front_mut) {
                    head.after = blockers;
                    if matches!(head.action, StepAction::Apply { .. }) {
                        head.action = StepAction::Reapply;
                    }
                }
                None
            }
            Prepared::Done => {
                self.tearing_down.remove(key);
                self.pop(key);
                None
            }
            Prepared::Call(call) => {
                self.tearing_down.remove(key);
                self.pop(key);
                Some(call)
            }
        }
    }

    /// Drop the key's remaining steps and fail it
    fn give_up(&mut self, graph: &mut GraphWriter, key: &str) {
        self.queue.remove(key);
        self.tearing_down.remove(key);
        let Some(node) = graph.get_node(key) else {
            return;
        };
        let prev = Prev {
            state: node.state(),
            value: node.value().cloned(),
        };
        self.update_node(graph, key, |n| {
            n.state = ValueState::Failed;
            n.error = Some(KvError::Unsettled {
                key: key.to_string(),
                steps: MAX_KEY_VISITS,
            });
        });
        self.record(graph, key, None, &prev);
        self.on_unavailable(graph, key);
    }

    fn pop(&mut self, key: &str) {
        if let Some(steps) = self.queue.get_mut(key) {
            steps.pop_front();
        }
    }

    fn set_intent(
        &mut self,
        graph: &mut GraphWriter,
        key: &str,
        value: &ValueRef,
        origin: ValueOrigin,
        metadata: Option<MetadataRef>,
        derived_from: Option<String>,
    ) {
        let descriptor = self.registry.lookup(key).cloned();
        let retry = self.opts.retry;
        let seq = self.seq;
        let node = graph.put_node(key, Arc::clone(value), origin);
        if let Some(descriptor) = &descriptor {
            node.descriptor = Some(descriptor.name().to_string());
            node.label = descriptor.key_label(key);
            node.dependencies = descriptor.dependencies(key, value);
        }
        if derived_from.is_some() {
            node.derived_from = derived_from;
        }
        if origin == ValueOrigin::FromSb {
            node.applied = Some(Arc::clone(value));
            node.applied_dependencies = node.dependencies.clone();
            node.metadata = metadata;
        } else {
            node.retry = retry;
            node.attempts = 0;
        }
        node.intent_seq = seq;
        node.last_update = seq;
    }

    /// Decide what brings the node to its intent
    fn converge(&mut self, graph: &mut GraphWriter, key: &str, prev: &Prev) -> Prepared {
        let Some(node) = graph.get_node(key).cloned() else {
            return Prepared::Done;
        };
        let Some(intent) = node.intent.clone() else {
            return self.teardown(graph, key, Teardown::Remove, prev);
        };

        if node.origin == ValueOrigin::FromSb {
            self.update_node(graph, key, |n| {
                n.state = ValueState::Obtained;
                n.error = None;
            });
            self.record(graph, key, None, prev);
            self.on_available(graph, key);
            return Prepared::Done;
        }

        let Some(descriptor) = node
            .descriptor
            .as_deref()
            .and_then(|name| self.registry.get(name))
            .cloned()
        else {
            if node.is_derived() {
                if node.state != ValueState::Configured {
                    self.update_node(graph, key, |n| {
                        n.state = ValueState::Configured;
                        n.applied = Some(intent.clone());
                        n.error = None;
                    });
                    self.record(graph, key, None, prev);
                    self.on_available(graph, key);
                }
            } else {
                self.update_node(graph, key, |n| {
                    n.state = ValueState::Unimplemented;
                    n.error = Some(KvError::Unimplemented { key: key.to_string() });
                });
                self.record(graph, key, None, prev);
            }
            return Prepared::Done;
        };

        if let Err(err) = descriptor.validate(key, &intent) {
            let (field, reason) = match err {
                DescriptorError::InvalidValue { field, reason } => (field, reason),
                other => ("value".to_string(), other.to_string()),
            };
            warn!(seq = self.seq, key, field = %field, reason = %reason, "invalid value");
            self.update_node(graph, key, |n| {
                n.state = ValueState::Invalid;
                n.error = Some(KvError::InvalidValue {
                    key: key.to_string(),
                    field,
                    reason,
                });
            });
            self.record(graph, key, None, prev);
            self.on_unavailable(graph, key);
            return Prepared::Done;
        }

        let excluded = self.excluded();
        let unmet = graph.unmet_dependencies(&node, &node.dependencies, &excluded);
        if !unmet.is_empty() {
            if node.applied.is_some() {
                return self.teardown(graph, key, Teardown::Unconfigure, prev);
            }
            let error = graph
                .failed_dependency(&node.dependencies)
                .map(|dependency| KvError::BlockedByFailedDependency {
                    key: key.to_string(),
                    dependency,
                });
            trace!(seq = self.seq, key, ?unmet, "dependencies unmet");
            let changed = node.state != ValueState::Pending || node.error != error;
            self.update_node(graph, key, |n| {
                n.state = ValueState::Pending;
                n.error = error;
            });
            if changed || prev.state == ValueState::NonExistent {
                self.record(graph, key, None, prev);
            }
            return Prepared::Done;
        }

        match node.applied.clone() {
            None => Prepared::Call(PendingCall {
                key: key.to_string(),
                kind: CallKind::Create,
                descriptor,
                value: intent,
                old: None,
                metadata: None,
                prev: prev.clone(),
            }),
            Some(applied) if descriptor.equivalent(key, &applied, &intent) => {
                if let Some(n) = graph.node_mut(key) {
                    n.applied_dependencies = n.dependencies.clone();
                }
                if node.state != ValueState::Configured || node.error.is_some() {
                    self.update_node(graph, key, |n| {
                        n.state = ValueState::Configured;
                        n.error = None;
                        n.attempts = 0;
                    });
                    self.record(graph, key, None, prev);
                    self.on_available(graph, key);
                }
                Prepared::Done
            }
            Some(applied) => {
                let recreate = !descriptor.supports_update()
                    || descriptor.update_with_recreate(key, &applied, &intent, node.metadata.as_ref());
                if recreate {
                    return self.teardown(graph, key, Teardown::Recreate, prev);
                }
                Prepared::Call(PendingCall {
                    key: key.to_string(),
                    kind: CallKind::Update,
                    descriptor,
                    value: intent,
                    old: Some(applied),
                    metadata: node.metadata.clone(),
                    prev: prev.clone(),
                })
            }
        }
    }

    /// Remove the node's southbound state once nothing relies on it
    fn teardown(
        &mut self,
        graph: &mut GraphWriter,
        key: &str,
        mode: Teardown,
        prev: &Prev,
    ) -> Prepared {
        let Some(node) = graph.get_node(key).cloned() else {
            return Prepared::Done;
        };
        let blockers = self.teardown_blockers(graph, key);
        if !blockers.is_empty() {
            return Prepared::Blocked(blockers);
        }
        if mode == Teardown::Remove {
            self.update_node(graph, key, |n| n.intent = None);
        }

        let descriptor = node
            .descriptor
            .as_deref()
            .and_then(|name| self.registry.get(name))
            .cloned();
        match (node.applied.clone(), descriptor) {
            (Some(applied), Some(descriptor)) if node.is_managed() => Prepared::Call(PendingCall {
                key: key.to_string(),
                kind: CallKind::Delete(mode),
                descriptor,
                value: applied,
                old: None,
                metadata: node.metadata.clone(),
                prev: prev.clone(),
            }),
            _ => {
                self.after_delete(graph, key, mode, None, prev);
                Prepared::Done
            }
        }
    }

    /// Derived children and dependents that must be torn down before `key`
    fn teardown_blockers(&mut self, graph: &GraphSnapshot, key: &str) -> BTreeSet<String> {
        let mut blockers = BTreeSet::new();
        for child in graph.derived_children(key) {
            self.enqueue(&child, StepAction::Remove);
            blockers.insert(child);
        }

        let mut excluded = self.excluded();
        excluded.insert(key.to_string());
        for dependent in graph.dependents(key) {
            let Some(node) = graph.get_node(&dependent) else {
                continue;
            };
            if node.origin() == ValueOrigin::FromSb {
                continue;
            }
            if self.in_flight.contains_key(&dependent) {
                blockers.insert(dependent);
                continue;
            }
            if node.applied_value().is_none() {
                continue;
            }
            let loses_dependency = node
                .all_dependencies()
                .any(|d| d.refers_to(key) && !graph.dependency_satisfied(d, &excluded));
            if loses_dependency {
                self.enqueue(&dependent, StepAction::Unconfigure);
                blockers.insert(dependent);
            }
        }
        blockers
    }

    /// Keys on their way out; they cannot satisfy dependencies
    fn excluded(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .queue
            .iter()
            .filter(|(_, steps)| steps.iter().any(|s| s.action.is_teardown()))
            .map(|(key, _)| key.clone())
            .collect();
        out.extend(self.tearing_down.iter().cloned());
        out.extend(
            self.in_flight
                .iter()
                .filter(|(_, kind)| matches!(kind, CallKind::Delete(_)))
                .map(|(key, _)| key.clone()),
        );
        out
    }

    async fn invoke(
        &self,
        ctx: OpContext,
        calls: Vec<PendingCall>,
    ) -> Vec<(PendingCall, Result<Option<MetadataRef>, DescriptorError>)> {
        if self.opts.dry_run {
            return calls
                .into_iter()
                .map(|call| {
                    let result = match call.kind {
                        CallKind::Create | CallKind::Update => Ok(call.metadata.clone()),
                        CallKind::Delete(_) => Ok(None),
                    };
                    (call, result)
                })
                .collect();
        }

        let tasks = calls.into_iter().map(|call| {
            let ctx = ctx.clone();
            let permits = Arc::clone(&self.permits);
            async move {
                let _permit = permits.acquire_owned().await.ok();
                let fallback = call.clone();
                match tokio::task::spawn_blocking(move || {
                    let result = call.invoke(&ctx);
                    (call, result)
                })
                .await
                {
                    Ok(done) => done,
                    Err(err) => (
                        fallback,
                        Err(DescriptorError::Failed(format!("callback aborted: {err}"))),
                    ),
                }
            }
        });
        join_all(tasks).await
    }

    fn complete(
        &mut self,
        graph: &mut GraphWriter,
        call: PendingCall,
        result: Result<Option<MetadataRef>, DescriptorError>,
    ) {
        let key = call.key.as_str();
        match (call.kind, result) {
            (CallKind::Create | CallKind::Update, Ok(metadata)) => {
                debug!(seq = self.seq, key, operation = %call.operation(), "value configured");
                let value = Arc::clone(&call.value);
                self.update_node(graph, key, |n| {
                    n.applied = Some(value);
                    n.applied_dependencies = n.dependencies.clone();
                    n.metadata = metadata;
                    n.state = ValueState::Configured;
                    n.error = None;
                    n.attempts = 0;
                });
                self.record(graph, key, Some(call.operation()), &call.prev);
                self.on_available(graph, key);
            }
            (CallKind::Delete(mode), Ok(_)) => {
                debug!(seq = self.seq, key, ?mode, "value deleted");
                self.after_delete(graph, key, mode, Some(Operation::Delete), &call.prev);
            }
            (_, Err(err)) => self.on_failure(graph, &call, &err),
        }
    }

    fn on_failure(&mut self, graph: &mut GraphWriter, call: &PendingCall, err: &DescriptorError) {
        let key = call.key.as_str();
        let operation = call.operation();
        let retriable = call.descriptor.is_retriable_failure(err);
        let mut attempts = 0;
        let mut state = ValueState::Failed;
        self.update_node(graph, key, |n| {
            n.attempts += 1;
            attempts = n.attempts;
            if retriable && n.retry.is_some_and(|p| p.allows_retry(n.attempts)) {
                n.state = ValueState::Retrying;
            } else {
                n.state = ValueState::Failed;
            }
            state = n.state;
            n.error = Some(KvError::Operation {
                key: key.to_string(),
                operation,
                message: err.to_string(),
                retriable,
                attempts,
            });
        });
        warn!(
            seq = self.seq,
            key,
            %operation,
            attempt = attempts,
            retriable,
            ?state,
            error = %err,
            "operation failed"
        );
        self.record(graph, key, Some(operation), &call.prev);
        self.on_unavailable(graph, key);
    }

    fn after_delete(
        &mut self,
        graph: &mut GraphWriter,
        key: &str,
        mode: Teardown,
        operation: Option<Operation>,
        prev: &Prev,
    ) {
        match mode {
            Teardown::Remove => {
                graph.delete_node(key);
            }
            Teardown::Unconfigure | Teardown::Recreate => {
                self.update_node(graph, key, |n| {
                    n.applied = None;
                    n.applied_dependencies.clear();
                    n.metadata = None;
                    n.state = ValueState::Pending;
                    n.error = None;
                });
            }
        }
        let changed = operation.is_some()
            || !graph
                .get_node(key)
                .is_some_and(|n| n.state() == prev.state);
        if changed {
            self.record(graph, key, operation, prev);
        }
        match mode {
            Teardown::Remove => {}
            // another candidate may still satisfy the dependency
            Teardown::Unconfigure => self.enqueue(key, StepAction::Reapply),
            Teardown::Recreate => {
                let ticket = self.take_ticket();
                self.queue
                    .entry(key.to_string())
                    .or_default()
                    .push_front(QueuedStep {
                        ticket,
                        action: StepAction::Reapply,
                        after: BTreeSet::new(),
                    });
            }
        }
    }

    /// Value became available: sync derived values, wake dependents
    fn on_available(&mut self, graph: &GraphWriter, key: &str) {
        let Some(node) = graph.get_node(key).cloned() else {
            return;
        };

        if !node.is_derived() {
            if let (Some(intent), Some(descriptor)) = (
                node.intent.clone(),
                node.descriptor.as_deref().and_then(|n| self.registry.get(n)).cloned(),
            ) {
                let derived = descriptor.derived_values(key, &intent);
                let wanted: BTreeSet<&str> = derived.iter().map(|kv| kv.key.as_str()).collect();
                for child in graph.derived_children(key) {
                    if !wanted.contains(child.as_str()) {
                        self.enqueue(&child, StepAction::Remove);
                    }
                }
                for kv in derived {
                    let up_to_date = graph.get_node(&kv.key).is_some_and(|child| {
                        child.state().is_available()
                            && child.derived_from() == Some(key)
                            && child.value().is_some_and(|current| {
                                match self.registry.lookup(&kv.key) {
                                    Some(d) => d.equivalent(&kv.key, current, &kv.value),
                                    None => describe(&**current) == describe(&*kv.value),
                                }
                            })
                    });
                    if !up_to_date {
                        self.enqueue(
                            &kv.key,
                            StepAction::Apply {
                                value: kv.value,
                                origin: node.origin(),
                                metadata: None,
                                derived_from: Some(key.to_string()),
                            },
                        );
                    }
                }
            }
        }

        for dependent in graph.dependents(key) {
            let pending = graph
                .get_node(&dependent)
                .is_some_and(|d| d.state() == ValueState::Pending && d.value().is_some());
            if pending {
                self.enqueue(&dependent, StepAction::Reapply);
            }
        }
    }

    /// Value stopped being available: tear down what relied on it
    fn on_unavailable(&mut self, graph: &mut GraphWriter, key: &str) {
        let failed_for_good = graph
            .get_node(key)
            .is_some_and(|n| matches!(n.state(), ValueState::Failed | ValueState::Invalid));

        for child in graph.derived_children(key) {
            self.enqueue(&child, StepAction::Remove);
        }

        let excluded = self.excluded();
        for dependent in graph.dependents(key) {
            let Some(node) = graph.get_node(&dependent).cloned() else {
                continue;
            };
            if node.origin() == ValueOrigin::FromSb {
                continue;
            }
            let relies = node
                .all_dependencies()
                .any(|d| d.refers_to(key) && !graph.dependency_satisfied(d, &excluded));
            if !relies {
                continue;
            }
            if node.applied_value().is_some() {
                self.enqueue(&dependent, StepAction::Unconfigure);
            } else if failed_for_good
                && node.state() == ValueState::Pending
                && node.dependencies().iter().any(|d| d.key() == Some(key))
            {
                let prev = Prev {
                    state: node.state(),
                    value: node.value().cloned(),
                };
                self.update_node(graph, &dependent, |n| {
                    n.error = Some(KvError::BlockedByFailedDependency {
                        key: dependent.clone(),
                        dependency: key.to_string(),
                    });
                });
                self.record(graph, &dependent, None, &prev);
            }
        }
    }

    fn update_node(&self, graph: &mut GraphWriter, key: &str, f: impl FnOnce(&mut Node)) {
        if let Some(node) = graph.node_mut(key) {
            f(node);
            node.last_update = self.seq;
        }
    }

    fn record(&mut self, graph: &GraphSnapshot, key: &str, operation: Option<Operation>, prev: &Prev) {
        let node = graph.get_node(key);
        let op = RecordedOp {
            key: key.to_string(),
            operation,
            prev_state: prev.state,
            new_state: node.map_or(ValueState::Removed, |n| n.state()),
            prev_value: prev.value.as_ref().map(|v| describe(&**v)),
            new_value: node.and_then(|n| n.value()).map(|v| describe(&**v)),
            error: node.and_then(|n| n.error()).map(ToString::to_string),
            derived: node.is_some_and(|n| n.is_derived()),
            is_retry: self.opts.is_retry,
            is_revert: self.opts.is_revert,
            dry_run: self.opts.dry_run,
        };
        trace!(seq = self.seq, key, ?operation, new_state = ?op.new_state, "recorded");
        self.out.ops.push(op);
        let last = self.out.touched.entry(key.to_string()).or_insert(None);
        if operation.is_some() {
            *last = operation;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::planner::PlannedStep;
    use crate::test_harness::{MockDescriptor, MockSouthbound, MockValue};
    use crate::value::value_ref;

    fn apply(key: &str, label: String) -> PlannedStep {
        PlannedStep {
            key: key.to_string(),
            action: StepAction::Apply {
                value: value_ref(MockValue::new(label)),
                origin: ValueOrigin::FromNb,
                metadata: None,
                derived_from: None,
            },
            after: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_key_that_never_settles_fails() {
        let sb = MockSouthbound::new();
        let mut registry = Registry::new();
        registry
            .register(MockDescriptor::new("iface", "config/if/", &sb).with_update())
            .unwrap();
        let key = "config/if/eth0";
        let mut plan = Plan::default();
        for i in 0..=MAX_KEY_VISITS + 3 {
            plan.steps.push(apply(key, format!("v{i}")));
        }

        let store = GraphStore::new();
        let mut graph = store.begin();
        let out = Executor::new(&registry, Arc::new(Semaphore::new(2)), 1, ExecOptions::default())
            .run(&mut graph, plan)
            .await;

        let node = graph.get_node(key).unwrap();
        assert_eq!(node.state(), ValueState::Failed);
        assert_eq!(
            node.error(),
            Some(&KvError::Unsettled {
                key: key.to_string(),
                steps: MAX_KEY_VISITS,
            })
        );
        assert_eq!(sb.calls().len(), MAX_KEY_VISITS as usize);
        assert_eq!(out.ops.last().map(|op| op.new_state), Some(ValueState::Failed));
    }
}
