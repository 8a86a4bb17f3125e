//! Metrics sinks for the execution substrate.
//!
//! Every `Runner` call produces one [`RunRecord`]. The default sink emits it as
//! a `tracing` event on target `graph_kernel::metrics`, so metrics can be
//! aggregated from structured logs.
//!
//! ## Metrics Emitted
//!
//! - `run` - one event per call (operation, target, duration, retries, outcome)
//! - `breaker_transition` - circuit breaker state changes
//! - counters - free-form increments (fusion merges, import rows, ...)

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::breaker::BreakerState;

/// Final outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The operation returned a value.
    Success,
    /// The operation failed; carries the error code.
    Failure(String),
}

impl RunOutcome {
    /// Label used in metric events.
    pub fn label(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Failure(code) => code,
        }
    }
}

/// Observation of a single `Runner` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Operation name.
    pub operation: String,
    /// Target identifier.
    pub target: String,
    /// Wall-clock duration including backoff sleeps.
    pub duration: Duration,
    /// Attempts made (0 when the breaker rejected the call).
    pub attempts: u32,
    /// Retries made (`attempts - 1`, saturating).
    pub retries: u32,
    /// Final outcome.
    pub outcome: RunOutcome,
}

/// Destination of execution metrics.
pub trait MetricsSink: Send + Sync {
    /// Record a completed call.
    fn record_run(&self, record: &RunRecord);

    /// Record a circuit breaker state change.
    fn record_breaker_transition(&self, _breaker: &str, _from: BreakerState, _to: BreakerState) {}

    /// Increment a counter by `by`.
    fn increment(&self, _metric_name: &str, _by: u64) {}
}

/// Emits metrics as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_run(&self, record: &RunRecord) {
        info!(
            target: "graph_kernel::metrics",
            metric_type = "run",
            operation = %record.operation,
            target_id = %record.target,
            duration_ms = record.duration.as_millis() as u64,
            attempts = record.attempts,
            retries = record.retries,
            outcome = record.outcome.label(),
            "run_metric"
        );
    }

    fn record_breaker_transition(&self, breaker: &str, from: BreakerState, to: BreakerState) {
        info!(
            target: "graph_kernel::metrics",
            metric_type = "breaker_transition",
            breaker = breaker,
            from = %from,
            to = %to,
            "breaker_metric"
        );
    }

    fn increment(&self, metric_name: &str, by: u64) {
        info!(
            target: "graph_kernel::metrics",
            metric_type = "counter",
            metric = metric_name,
            by = by,
            "counter_metric"
        );
    }
}

/// No-op metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn record_run(&self, _record: &RunRecord) {}
}

/// In-memory metrics for testing.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    runs: Mutex<Vec<RunRecord>>,
    transitions: Mutex<Vec<(String, BreakerState, BreakerState)>>,
    counters: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded calls, in order.
    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().clone()
    }

    /// Recorded calls for one operation.
    pub fn runs_for(&self, operation: &str) -> Vec<RunRecord> {
        self.runs
            .lock()
            .iter()
            .filter(|r| r.operation == operation)
            .cloned()
            .collect()
    }

    /// Recorded breaker transitions, in order.
    pub fn transitions(&self) -> Vec<(String, BreakerState, BreakerState)> {
        self.transitions.lock().clone()
    }

    /// Get the count for a counter.
    pub fn get_count(&self, metric_name: &str) -> u64 {
        self.counters.lock().get(metric_name).copied().unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_run(&self, record: &RunRecord) {
        self.runs.lock().push(record.clone());
    }

    fn record_breaker_transition(&self, breaker: &str, from: BreakerState, to: BreakerState) {
        self.transitions.lock().push((breaker.to_string(), from, to));
    }

    fn increment(&self, metric_name: &str, by: u64) {
        *self.counters.lock().entry(metric_name.to_string()).or_insert(0) += by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_metrics() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("fusion_merges_total", 2);
        metrics.increment("fusion_merges_total", 1);
        metrics.record_run(&RunRecord {
            operation: "get_entity".to_string(),
            target: "a".to_string(),
            duration: Duration::from_millis(3),
            attempts: 2,
            retries: 1,
            outcome: RunOutcome::Success,
        });

        assert_eq!(metrics.get_count("fusion_merges_total"), 3);
        assert_eq!(metrics.get_count("other"), 0);
        assert_eq!(metrics.runs_for("get_entity").len(), 1);
        assert_eq!(metrics.runs()[0].outcome.label(), "success");
    }
}
