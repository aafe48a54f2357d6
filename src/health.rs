//! `GET /health`: liveness plus store/broker dependency probes, status
//! mirrored in the HTTP status code.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::broker::Broker;
use crate::store::Store;
use crate::subscription::SessionTable;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub sessions: Arc<SessionTable>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct ServiceStatuses {
    store: bool,
    broker: bool,
    subscriptions: usize,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    services: ServiceStatuses,
    uptime_seconds: u64,
}

pub async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let store_ok = state.store.ping().await;
    let broker_ok = state.broker.ping().await;
    let healthy = store_ok && broker_ok;

    let body = HealthBody {
        status: if healthy { "healthy" } else { "degraded" },
        timestamp: chrono::Utc::now(),
        services: ServiceStatuses {
            store: store_ok,
            broker: broker_ok,
            subscriptions: state.sessions.live_count(),
        },
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(body))
}
