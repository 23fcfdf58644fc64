//! Per-step retry metrics

use std::collections::HashMap;

use dashmap::DashMap;

/// Counters recorded for one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepRetryStats {
    /// Retry attempts scheduled (excluding the initial attempt)
    pub retry_attempts: u64,

    /// Executions that succeeded after at least one retry
    pub successes_after_retry: u64,

    /// Executions that exhausted every attempt
    pub exhausted_retries: u64,

    /// Error type of the most recent failure
    pub last_failure_kind: Option<String>,
}

/// Registry of per-step retry counters
#[derive(Debug, Default)]
pub struct RetryMetrics {
    stats: DashMap<String, StepRetryStats>,
}

impl RetryMetrics {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scheduled retry
    pub fn record_retry_attempt(&self, step_id: &str) {
        self.stats.entry(step_id.to_string()).or_default().retry_attempts += 1;
    }

    /// Record a success that needed at least one retry
    pub fn record_success_after_retry(&self, step_id: &str) {
        self.stats
            .entry(step_id.to_string())
            .or_default()
            .successes_after_retry += 1;
    }

    /// Record an execution that ran out of attempts
    pub fn record_exhausted(&self, step_id: &str) {
        self.stats
            .entry(step_id.to_string())
            .or_default()
            .exhausted_retries += 1;
    }

    /// Record the most recent failure kind
    pub fn record_failure_kind(&self, step_id: &str, kind: Option<&str>) {
        self.stats.entry(step_id.to_string()).or_default().last_failure_kind =
            kind.map(str::to_string);
    }

    /// Snapshot one step's counters
    pub fn snapshot(&self, step_id: &str) -> Option<StepRetryStats> {
        self.stats.get(step_id).map(|s| s.clone())
    }

    /// Snapshot every step's counters
    pub fn snapshot_all(&self) -> HashMap<String, StepRetryStats> {
        self.stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
