//! In-memory southbound and a configurable descriptor over it
//!
//! The southbound records every call and flags ordering violations: creating
//! a value before its dependencies exist, or deleting a value something else
//! still depends on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::descriptor::{Dependency, Descriptor, IndexedMetadata, OpContext};
use crate::error::DescriptorError;
use crate::graph::ValueState;
use crate::scheduler::Scheduler;
use crate::value::{KeyValuePair, KvWithMetadata, Operation, ValueOrigin};

/// Value handled by [`MockDescriptor`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MockValue {
    /// Label; an empty label fails validation
    pub label: String,
    /// Keys this value depends on
    pub deps: Vec<String>,
    /// Prefixes of which at least one value must exist
    pub any_of: Vec<String>,
    /// Derived values as `(key, label)`
    pub derived: Vec<(String, String)>,
}

impl MockValue {
    /// Value without dependencies
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Depend on `key`
    #[must_use]
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.deps.push(key.into());
        self
    }

    /// Depend on any key under `prefix`
    #[must_use]
    pub fn any_of(mut self, prefix: impl Into<String>) -> Self {
        self.any_of.push(prefix.into());
        self
    }

    /// Derive a child value at `key`
    #[must_use]
    pub fn derive(mut self, key: impl Into<String>, label: impl Into<String>) -> Self {
        self.derived.push((key.into(), label.into()));
        self
    }
}

/// Southbound-assigned index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockMetadata {
    /// Southbound index of the value
    pub index: u32,
}

impl IndexedMetadata for MockMetadata {
    fn index(&self) -> u32 {
        self.index
    }
}

/// One recorded southbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbCall {
    /// Key of the call
    pub key: String,
    /// Operation invoked
    pub operation: Operation,
    /// Whether the call succeeded
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Injected {
    Retriable,
    Fatal,
}

#[derive(Debug, Clone)]
struct SbEntry {
    value: MockValue,
    index: u32,
}

#[derive(Debug, Default)]
struct SbState {
    values: BTreeMap<String, SbEntry>,
    calls: Vec<SbCall>,
    failures: BTreeMap<String, VecDeque<Injected>>,
    always_fail: BTreeMap<String, Injected>,
    violations: Vec<String>,
    next_index: u32,
}

/// Shared simulated southbound
#[derive(Debug, Default)]
pub struct MockSouthbound {
    state: Mutex<SbState>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSouthbound {
    /// Empty southbound
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` operations on `key`
    pub fn fail_next(&self, key: &str, times: usize, retriable: bool) {
        let kind = if retriable { Injected::Retriable } else { Injected::Fatal };
        self.state
            .lock()
            .failures
            .entry(key.to_string())
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
    }

    /// Fail every operation on `key` until [`Self::heal`]
    pub fn fail_always(&self, key: &str, retriable: bool) {
        let kind = if retriable { Injected::Retriable } else { Injected::Fatal };
        self.state.lock().always_fail.insert(key.to_string(), kind);
    }

    /// Stop injecting failures for `key`
    pub fn heal(&self, key: &str) {
        let mut state = self.state.lock();
        state.always_fail.remove(key);
        state.failures.remove(key);
    }

    /// Make every call block for `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Every call so far, failed ones included
    #[must_use]
    pub fn calls(&self) -> Vec<SbCall> {
        self.state.lock().calls.clone()
    }

    /// Successful operations on `key`
    #[must_use]
    pub fn calls_for(&self, key: &str) -> Vec<Operation> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.key == key && c.ok)
            .map(|c| c.operation)
            .collect()
    }

    /// Attempts of `operation` on `key`, failed ones included
    #[must_use]
    pub fn attempts(&self, key: &str, operation: Operation) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.key == key && c.operation == operation)
            .count()
    }

    /// Keys of successful calls in call order
    #[must_use]
    pub fn call_order(&self, operation: Operation) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.ok)
            .map(|c| c.key.clone())
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Whether the southbound holds `key`
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().values.contains_key(key)
    }

    /// Value held for `key`
    #[must_use]
    pub fn value(&self, key: &str) -> Option<MockValue> {
        self.state.lock().values.get(key).map(|e| e.value.clone())
    }

    /// Index assigned to `key`
    #[must_use]
    pub fn index_of(&self, key: &str) -> Option<u32> {
        self.state.lock().values.get(key).map(|e| e.index)
    }

    /// Keys held by the southbound
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    /// Ordering violations seen by the southbound
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Highest number of calls observed running at once
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Change the southbound behind the scheduler's back
    pub fn insert_external(&self, key: &str, value: MockValue) -> u32 {
        let mut state = self.state.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.values.insert(key.to_string(), SbEntry { value, index });
        index
    }

    /// Remove a value behind the scheduler's back
    pub fn remove_external(&self, key: &str) {
        self.state.lock().values.remove(key);
    }

    fn enter(&self, key: &str, operation: Operation) -> Result<(), DescriptorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        let queued = state.failures.get_mut(key).and_then(VecDeque::pop_front);
        let injected = queued.or_else(|| state.always_fail.get(key).copied());
        let ok = injected.is_none();
        state.calls.push(SbCall {
            key: key.to_string(),
            operation,
            ok,
        });
        match injected {
            None => Ok(()),
            Some(Injected::Retriable) => Err(DescriptorError::Unavailable(format!(
                "{operation} of {key} rejected"
            ))),
            Some(Injected::Fatal) => Err(DescriptorError::Failed(format!(
                "{operation} of {key} failed"
            ))),
        }
    }

    fn create(&self, key: &str, value: &MockValue) -> Result<MockMetadata, DescriptorError> {
        self.enter(key, Operation::Create)?;
        let mut state = self.state.lock();
        check_dependencies(&mut state, key, value);
        let index = state.next_index;
        state.next_index += 1;
        state.values.insert(
            key.to_string(),
            SbEntry {
                value: value.clone(),
                index,
            },
        );
        Ok(MockMetadata { index })
    }

    fn update(&self, key: &str, value: &MockValue) -> Result<MockMetadata, DescriptorError> {
        self.enter(key, Operation::Update)?;
        let mut state = self.state.lock();
        check_dependencies(&mut state, key, value);
        let next = state.next_index;
        let entry = state.values.entry(key.to_string()).or_insert(SbEntry {
            value: value.clone(),
            index: next,
        });
        entry.value = value.clone();
        let index = entry.index;
        if index == next {
            state.next_index += 1;
        }
        Ok(MockMetadata { index })
    }

    fn delete(&self, key: &str) -> Result<(), DescriptorError> {
        self.enter(key, Operation::Delete)?;
        let mut state = self.state.lock();
        if state.values.remove(key).is_none() {
            state.violations.push(format!("deleted missing value {key}"));
        }
        let dependents: Vec<String> = state
            .values
            .iter()
            .filter(|(_, entry)| entry.value.deps.iter().any(|d| d == key))
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            state
                .violations
                .push(format!("deleted {key} while {dependent} depends on it"));
        }
        Ok(())
    }

    fn dump(&self, prefix: &str) -> Vec<(String, SbEntry)> {
        self.state
            .lock()
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

fn check_dependencies(state: &mut SbState, key: &str, value: &MockValue) {
    for dep in &value.deps {
        if !state.values.contains_key(dep) {
            state
                .violations
                .push(format!("configured {key} before its dependency {dep}"));
        }
    }
    for prefix in &value.any_of {
        if !state.values.keys().any(|k| k.starts_with(prefix.as_str())) {
            state
                .violations
                .push(format!("configured {key} with nothing under {prefix}"));
        }
    }
}

/// Descriptor over [`MockSouthbound`] with switchable capabilities
#[derive(Debug, Clone)]
pub struct MockDescriptor {
    name: String,
    prefix: String,
    sb: Arc<MockSouthbound>,
    update: bool,
    recreate: bool,
    retrieve: bool,
    retrieve_after: Vec<String>,
}

impl MockDescriptor {
    /// Descriptor `name` owning keys under `prefix`
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, sb: &Arc<MockSouthbound>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            sb: Arc::clone(sb),
            update: false,
            recreate: false,
            retrieve: false,
            retrieve_after: Vec::new(),
        }
    }

    /// Support in-place updates
    #[must_use]
    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    /// Changes of dependencies are applied by re-creating the value
    #[must_use]
    pub fn with_recreate(mut self) -> Self {
        self.update = true;
        self.recreate = true;
        self
    }

    /// Support retrieve
    #[must_use]
    pub fn with_retrieve(mut self) -> Self {
        self.retrieve = true;
        self
    }

    /// Retrieve after `descriptor`
    #[must_use]
    pub fn retrieve_after(mut self, descriptor: impl Into<String>) -> Self {
        self.retrieve_after.push(descriptor.into());
        self
    }
}

impl Descriptor for MockDescriptor {
    type Value = MockValue;
    type Metadata = MockMetadata;

    fn name(&self) -> &str {
        &self.name
    }

    fn key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn validate(&self, _key: &str, value: &MockValue) -> Result<(), DescriptorError> {
        if value.label.is_empty() {
            return Err(DescriptorError::invalid("label", "must not be empty"));
        }
        Ok(())
    }

    fn create(&self, _ctx: &OpContext, key: &str, value: &MockValue) -> Result<MockMetadata, DescriptorError> {
        self.sb.create(key, value)
    }

    fn supports_update(&self) -> bool {
        self.update
    }

    fn update(
        &self,
        _ctx: &OpContext,
        key: &str,
        _old: &MockValue,
        new: &MockValue,
        _metadata: Option<&MockMetadata>,
    ) -> Result<MockMetadata, DescriptorError> {
        self.sb.update(key, new)
    }

    fn update_with_recreate(
        &self,
        _key: &str,
        old: &MockValue,
        new: &MockValue,
        _metadata: Option<&MockMetadata>,
    ) -> bool {
        self.recreate && (old.deps != new.deps || old.any_of != new.any_of)
    }

    fn delete(
        &self,
        _ctx: &OpContext,
        key: &str,
        _value: &MockValue,
        _metadata: Option<&MockMetadata>,
    ) -> Result<(), DescriptorError> {
        self.sb.delete(key)
    }

    fn supports_retrieve(&self) -> bool {
        self.retrieve
    }

    fn retrieve(
        &self,
        _ctx: &OpContext,
        correlate: &[KvWithMetadata<MockValue, MockMetadata>],
    ) -> Result<Vec<KvWithMetadata<MockValue, MockMetadata>>, DescriptorError> {
        Ok(self
            .sb
            .dump(&self.prefix)
            .into_iter()
            .map(|(key, entry)| {
                let origin = if correlate.iter().any(|kv| kv.key == key) {
                    ValueOrigin::FromNb
                } else {
                    ValueOrigin::FromSb
                };
                KvWithMetadata {
                    key,
                    value: entry.value,
                    metadata: Some(MockMetadata { index: entry.index }),
                    origin,
                }
            })
            .collect())
    }

    /// Only injected unavailability is worth retrying
    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        matches!(err, DescriptorError::Unavailable(_))
    }

    fn dependencies(&self, _key: &str, value: &MockValue) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = value
            .deps
            .iter()
            .enumerate()
            .map(|(i, dep)| Dependency::on_key(format!("dep-{i}"), dep.clone()))
            .collect();
        if !value.any_of.is_empty() {
            deps.push(Dependency::any_of("any", value.any_of.clone()));
        }
        deps
    }

    fn derived_values(&self, _key: &str, value: &MockValue) -> Vec<KeyValuePair> {
        value
            .derived
            .iter()
            .map(|(key, label)| KeyValuePair::new(key.clone(), MockValue::new(label.clone())))
            .collect()
    }

    fn retrieve_dependencies(&self) -> Vec<String> {
        self.retrieve_after.clone()
    }
}

/// Poll the committed graph until `key` reaches `state`
pub async fn wait_for_state(scheduler: &Scheduler, key: &str, state: ValueState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = scheduler
            .graph()
            .get_node(key)
            .map_or(ValueState::NonExistent, |n| n.state());
        if current == state {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
