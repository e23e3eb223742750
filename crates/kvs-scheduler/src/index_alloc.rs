//! Guessing of southbound-assigned indices
//!
//! Some southbound APIs assign an index on create without returning it. The
//! allocator predicts the lowest free index the southbound will pick. A
//! predicted index stays `Tentative` until a retrieve observes it; only a
//! `Confirmed` index may be trusted. Allocations made concurrently outside of
//! this process can invalidate a guess.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether an allocated index was verified against the dataplane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexStatus {
    /// Predicted, not yet observed
    Tentative,
    /// Observed in the southbound
    Confirmed,
}

/// Gapless lowest-free index predictor
#[derive(Debug, Default)]
pub struct TentativeIndexAllocator {
    first: u32,
    indices: Mutex<BTreeMap<u32, IndexStatus>>,
}

impl TentativeIndexAllocator {
    /// Allocator starting at index 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose sequence starts at `first`
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            first,
            indices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve the lowest free index as tentative
    pub fn allocate(&self) -> u32 {
        let mut indices = self.indices.lock();
        let mut candidate = self.first;
        for &used in indices.range(self.first..).map(|(index, _)| index) {
            if used != candidate {
                break;
            }
            candidate = candidate.saturating_add(1);
        }
        indices.insert(candidate, IndexStatus::Tentative);
        debug!(index = candidate, "tentative index allocated");
        candidate
    }

    /// Mark an index as observed; returns false when it was never allocated
    pub fn confirm(&self, index: u32) -> bool {
        match self.indices.lock().get_mut(&index) {
            Some(status) => {
                *status = IndexStatus::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Forget an index so it can be handed out again
    pub fn release(&self, index: u32) {
        self.indices.lock().remove(&index);
    }

    /// Status of an allocated index, `None` when free
    #[must_use]
    pub fn status(&self, index: u32) -> Option<IndexStatus> {
        self.indices.lock().get(&index).copied()
    }

    /// Replace the guessed set with the indices actually observed
    pub fn reconcile(&self, observed: impl IntoIterator<Item = u32>) {
        let mut indices = self.indices.lock();
        indices.clear();
        indices.extend(observed.into_iter().map(|index| (index, IndexStatus::Confirmed)));
    }

    /// Number of allocated indices
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.lock().len()
    }

    /// Whether no index is allocated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.lock().is_empty()
    }
}
