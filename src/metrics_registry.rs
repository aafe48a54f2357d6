//! `GET /metrics`: Prometheus text exposition for request latency,
//! ingestion counters, cache hit/miss, rate-limit rejections, broker
//! publish failures, and active subscription sessions.
//!
//! [`metrics::counter!`] / [`metrics::histogram!`] calls are scattered
//! across the hot path, and a single process-wide [`PrometheusHandle`]
//! renders them on scrape.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Route-and-status-labeled request duration histogram name, recorded by
/// [`crate::context::request_context`].
pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_ms";
pub const INGEST_RECEIVED: &str = "ingest_received_total";
pub const INGEST_INSERTED: &str = "ingest_inserted_total";
pub const INGEST_DROPPED: &str = "ingest_dropped_total";
pub const CACHE_HITS: &str = "cache_hits_total";
pub const CACHE_MISSES: &str = "cache_misses_total";
pub const RATE_LIMIT_REJECTIONS: &str = "rate_limit_rejections_total";
pub const BROKER_PUBLISH_FAILURES: &str = "broker_publish_failures_total";
pub const ACTIVE_SESSIONS: &str = "active_subscription_sessions";

/// Installs the global Prometheus recorder and returns a handle whose
/// `render()` produces the text the `/metrics` endpoint serves.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

pub async fn metrics_handler(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> String {
    handle.render()
}
