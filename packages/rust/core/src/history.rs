//! Per-stage performance history, shared across requests.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;

use ragpipe_shared::{StageId, StageStatus, StageTrace};

/// Counters for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageStats {
    pub runs: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub total_latency_ms: u64,
}

impl StageStats {
    /// Mean latency of executed (non-cached) runs.
    pub fn mean_latency_ms(&self) -> f64 {
        let executed = self.runs - self.cache_hits;
        if executed == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / executed as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            (self.successes + self.cache_hits) as f64 / self.runs as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct PerformanceHistory {
    stats: DashMap<StageId, StageStats>,
}

impl PerformanceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, trace: &StageTrace) {
        let mut entry = self.stats.entry(trace.stage.clone()).or_default();
        entry.runs += 1;
        match trace.status {
            StageStatus::Success => entry.successes += 1,
            StageStatus::Timeout => entry.timeouts += 1,
            StageStatus::Failed => entry.failures += 1,
            StageStatus::SkippedCached => entry.cache_hits += 1,
            StageStatus::Pending | StageStatus::Running => {}
        }
        entry.total_latency_ms += trace.duration_ms;
    }

    pub fn get(&self, stage: &StageId) -> Option<StageStats> {
        self.stats.get(stage).map(|s| s.clone())
    }

    /// Point-in-time copy, ordered by stage id.
    pub fn snapshot(&self) -> BTreeMap<StageId, StageStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn trace(stage: StageId, status: StageStatus, ms: u64) -> StageTrace {
        StageTrace {
            stage,
            status,
            duration_ms: ms,
            errors: vec![],
            metrics: Default::default(),
        }
    }

    #[test]
    fn counts_by_status() {
        let history = PerformanceHistory::new();
        history.record(&trace(StageId::RETRIEVAL, StageStatus::Success, 40));
        history.record(&trace(StageId::RETRIEVAL, StageStatus::Timeout, 100));
        history.record(&trace(StageId::RETRIEVAL, StageStatus::SkippedCached, 0));
        history.record(&trace(StageId::CURATION, StageStatus::Failed, 3));

        let retrieval = history.get(&StageId::RETRIEVAL).unwrap();
        assert_eq!(retrieval.runs, 3);
        assert_eq!(retrieval.successes, 1);
        assert_eq!(retrieval.timeouts, 1);
        assert_eq!(retrieval.cache_hits, 1);
        assert_eq!(retrieval.mean_latency_ms(), 70.0);
        assert!((retrieval.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&StageId::CURATION].failures, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let history = Arc::new(PerformanceHistory::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let history = Arc::clone(&history);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        history.record(&trace(StageId::GENERATION, StageStatus::Success, 1));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let stats = history.get(&StageId::GENERATION).unwrap();
        assert_eq!(stats.runs, 800);
        assert_eq!(stats.total_latency_ms, 800);
    }
}
