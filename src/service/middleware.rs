//! Service middleware for request metrics.
//!
//! ## Metrics Exposed
//!
//! - `request` - one event per request by path pattern, method, status and latency
//! - `query` - one event per `/api/query` call by kind, result size and latency
//! - `fusion` - one event per `/api/fusion` run

use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use tracing::info;

use crate::fusion::FusionStats;

/// Records request counts and latency as `tracing` events on target
/// `graph_kernel::metrics`.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "graph_kernel::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Collapse entity ids in paths so the metric has bounded cardinality.
fn normalize_path(path: &str) -> String {
    static ENTITY_SEGMENT: OnceLock<Regex> = OnceLock::new();
    let re = ENTITY_SEGMENT.get_or_init(|| Regex::new(r"^/api/entities/[^/]+").expect("static regex"));
    re.replace(path, "/api/entities/:id").to_string()
}

/// Record a query execution.
pub fn record_query_metrics(kind: &str, entity_count: usize, latency_ms: u64) {
    info!(
        target: "graph_kernel::metrics",
        metric_type = "query",
        kind = kind,
        entity_count = entity_count,
        latency_ms = latency_ms,
        "query_metric"
    );
}

/// Record a fusion run.
pub fn record_fusion_metrics(stats: &FusionStats) {
    info!(
        target: "graph_kernel::metrics",
        metric_type = "fusion",
        entities_considered = stats.entities_considered,
        groups_merged = stats.groups_merged,
        relations_projected = stats.relations_projected,
        conflicts = stats.conflicts.len(),
        latency_ms = stats.duration_ms,
        "fusion_metric"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_replaces_entity_id() {
        assert_eq!(normalize_path("/api/entities/person-42"), "/api/entities/:id");
        assert_eq!(
            normalize_path("/api/entities/person-42/provenance"),
            "/api/entities/:id/provenance"
        );
    }

    #[test]
    fn test_normalize_path_preserves_regular_path() {
        assert_eq!(normalize_path("/health/ready"), "/health/ready");
        assert_eq!(normalize_path("/api/entities"), "/api/entities");
    }
}
