use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Result class of one ingestion call, used as a counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum IngestOutcome {
    Created = 0,
    Updated = 1,
    Reset = 2,
    Stale = 3,
    Rejected = 4,
    MarkedStopped = 5,
    Removed = 6,
}

const OUTCOME_CARDINALITY: usize = 7;

impl IngestOutcome {
    pub const ALL: [IngestOutcome; OUTCOME_CARDINALITY] = [
        Self::Created,
        Self::Updated,
        Self::Reset,
        Self::Stale,
        Self::Rejected,
        Self::MarkedStopped,
        Self::Removed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Reset => "reset",
            Self::Stale => "stale",
            Self::Rejected => "rejected",
            Self::MarkedStopped => "marked_stopped",
            Self::Removed => "removed",
        }
    }
}

/// Lock-free running totals of ingestion outcomes.
///
/// Totals only grow; readers see a relaxed but monotonic view.
pub struct IngestStats {
    counts: [AtomicU64; OUTCOME_CARDINALITY],
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, outcome: IngestOutcome) {
        self.record_n(outcome, 1);
    }

    pub fn record_n(&self, outcome: IngestOutcome, n: u64) {
        if let Some(counter) = self.counts.get(outcome as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self, outcome: IngestOutcome) -> u64 {
        self.counts
            .get(outcome as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Current totals for every outcome, including zeros.
    pub fn totals(&self) -> Vec<(IngestOutcome, u64)> {
        IngestOutcome::ALL
            .iter()
            .map(|outcome| (*outcome, self.get(*outcome)))
            .collect()
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}
