use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use warden_common::ErrorKind;

/// Terminal outcome of one request, as counted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(ErrorKind),
}

impl Outcome {
    pub const ALL_LABELS: [&'static str; 9] = [
        "success",
        "application_error",
        "worker_failure",
        "resource_exceeded",
        "quota_exceeded",
        "circuit_open",
        "backpressure",
        "validation_error",
        "internal",
    ];

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(kind) => kind.metric_label(),
        }
    }

    fn index(self) -> usize {
        let label = self.label();
        Self::ALL_LABELS
            .iter()
            .position(|l| *l == label)
            .unwrap_or(Self::ALL_LABELS.len() - 1)
    }
}

/// Request-level counters owned by the supervisor. Component-level counters
/// (cache, quota, pool, circuits) live in their components.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    outcomes: [AtomicU64; 9],
    pub attempts_total: AtomicU64,
    pub retries_total: AtomicU64,
    pub cache_hits_served: AtomicU64,
    pub execution_ms_sum: AtomicU64,
    pub execution_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCount {
    pub outcome: &'static str,
    pub count: u64,
}

impl RuntimeMetrics {
    pub fn record_outcome(&self, outcome: Outcome) {
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution_time(&self, ms: u64) {
        self.execution_ms_sum.fetch_add(ms, Ordering::Relaxed);
        self.execution_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn outcomes(&self) -> Vec<OutcomeCount> {
        Outcome::ALL_LABELS
            .iter()
            .zip(self.outcomes.iter())
            .map(|(label, count)| OutcomeCount {
                outcome: *label,
                count: count.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.outcomes.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_kind_has_a_slot() {
        let m = RuntimeMetrics::default();
        let kinds = [
            ErrorKind::ValidationError,
            ErrorKind::QuotaExceeded,
            ErrorKind::CircuitOpen,
            ErrorKind::WorkerFailure,
            ErrorKind::ResourceExceeded,
            ErrorKind::ApplicationError,
            ErrorKind::Backpressure,
            ErrorKind::Internal,
        ];
        m.record_outcome(Outcome::Success);
        for kind in kinds {
            m.record_outcome(Outcome::Failed(kind));
        }
        assert!(m.outcomes().iter().all(|o| o.count == 1));
        assert_eq!(m.total(), 9);
    }
}
