//! Transaction history
//!
//! Every processed transaction is recorded with its planned and executed
//! operations. The log is bounded by count and age.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::graph::ValueState;
use crate::planner::PlannedOp;
use crate::value::Operation;

/// What triggered a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnKind {
    /// Northbound Put/Delete batch
    NbTransaction,
    /// Southbound change pushed by a descriptor
    SbNotification,
    /// Retry of failed values
    RetryFailedOps,
    /// Southbound retrieval and drift healing
    Refresh,
}

/// Requested value of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedKv {
    /// Key of the value
    pub key: String,
    /// `None` for deletes
    pub value: Option<String>,
}

/// One executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedOp {
    /// Key the step acted on
    pub key: String,
    /// Southbound operation invoked, `None` when only the state changed
    pub operation: Option<Operation>,
    /// State before the step
    pub prev_state: ValueState,
    /// State after the step
    pub new_state: ValueState,
    /// Intended value before the step
    pub prev_value: Option<String>,
    /// Intended value after the step
    pub new_value: Option<String>,
    /// Error left by the step
    pub error: Option<String>,
    /// Whether the key is a derived value
    pub derived: bool,
    /// Step of a retry transaction
    pub is_retry: bool,
    /// Step restoring a previous value after a failure
    pub is_revert: bool,
    /// Step simulated without southbound calls
    pub dry_run: bool,
}

/// One processed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTxn {
    /// Sequence number of the transaction
    pub seq: u64,
    /// Kind of transaction
    pub kind: TxnKind,
    /// Caller-supplied description
    pub description: Option<String>,
    /// When processing started
    pub start: DateTime<Utc>,
    /// When processing finished
    pub stop: DateTime<Utc>,
    /// Requested values
    pub values: Vec<RecordedKv>,
    /// Planned steps
    pub planned: Vec<PlannedOp>,
    /// Steps as executed
    pub executed: Vec<RecordedOp>,
    /// Transaction-wide error, e.g. a rejected plan
    pub error: Option<String>,
}

impl RecordedTxn {
    /// Number of executed steps that ended in a failure state
    #[must_use]
    pub fn failures(&self) -> usize {
        self.executed
            .iter()
            .filter(|op| op.new_state.is_failure())
            .count()
    }

    /// One-line summary for logs
    #[must_use]
    pub fn summary(&self) -> String {
        let elapsed = (self.stop - self.start).num_milliseconds();
        let mut line = format!(
            "txn #{} {:?}: {} value(s), {} planned, {} executed, {} failed, {}ms",
            self.seq,
            self.kind,
            self.values.len(),
            self.planned.len(),
            self.executed.len(),
            self.failures(),
            elapsed
        );
        if let Some(desc) = &self.description {
            line.push_str(&format!(" ({desc})"));
        }
        if let Some(err) = &self.error {
            line.push_str(&format!(" error: {err}"));
        }
        line
    }
}

/// Bounded in-memory transaction log
#[derive(Debug)]
pub struct TxnHistory {
    inner: Mutex<VecDeque<RecordedTxn>>,
    limit: usize,
    age_limit: Duration,
}

impl TxnHistory {
    /// History keeping at most `limit` transactions no older than `age_limit`
    #[must_use]
    pub fn new(limit: usize, age_limit: Duration) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            limit,
            age_limit,
        }
    }

    /// Append a record, dropping entries over the count or age limit
    pub fn push(&self, txn: RecordedTxn) {
        let mut inner = self.inner.lock();
        let horizon = txn.stop - self.age_limit;
        inner.push_back(txn);
        while inner.len() > self.limit {
            inner.pop_front();
        }
        while inner.front().is_some_and(|t| t.stop < horizon) {
            inner.pop_front();
        }
    }

    /// All retained records, oldest first
    #[must_use]
    pub fn all(&self) -> Vec<RecordedTxn> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Recorded transaction by sequence number
    #[must_use]
    pub fn get(&self, seq: u64) -> Option<RecordedTxn> {
        self.inner.lock().iter().find(|t| t.seq == seq).cloned()
    }

    /// Records with `seq >= since`
    #[must_use]
    pub fn since(&self, since: u64) -> Vec<RecordedTxn> {
        self.inner
            .lock()
            .iter()
            .filter(|t| t.seq >= since)
            .cloned()
            .collect()
    }

    /// Number of recorded transactions
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(seq: u64, stop: DateTime<Utc>) -> RecordedTxn {
        RecordedTxn {
            seq,
            kind: TxnKind::NbTransaction,
            description: None,
            start: stop,
            stop,
            values: vec![],
            planned: vec![],
            executed: vec![],
            error: None,
        }
    }

    #[test]
    fn bounded_by_count() {
        let history = TxnHistory::new(2, Duration::hours(1));
        let now = Utc::now();
        for seq in 1..=3 {
            history.push(txn(seq, now));
        }
        let seqs: Vec<u64> = history.all().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(history.get(1).is_none());
    }

    #[test]
    fn bounded_by_age() {
        let history = TxnHistory::new(10, Duration::minutes(5));
        let now = Utc::now();
        history.push(txn(1, now - Duration::minutes(10)));
        history.push(txn(2, now));
        assert_eq!(history.len(), 1);
        assert_eq!(history.since(0)[0].seq, 2);
    }

    #[test]
    fn summary_mentions_failures() {
        let mut t = txn(4, Utc::now());
        t.description = Some("initial".into());
        t.executed.push(RecordedOp {
            key: "config/a".into(),
            operation: Some(Operation::Create),
            prev_state: ValueState::NonExistent,
            new_state: ValueState::Failed,
            prev_value: None,
            new_value: Some("1".into()),
            error: Some("boom".into()),
            derived: false,
            is_retry: false,
            is_revert: false,
            dry_run: false,
        });
        let line = t.summary();
        assert!(line.starts_with("txn #4"));
        assert!(line.contains("1 failed"));
        assert!(line.contains("(initial)"));
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_string(&txn(1, Utc::now())).unwrap();
        assert!(json.contains("\"kind\":\"nb-transaction\""));
    }
}
