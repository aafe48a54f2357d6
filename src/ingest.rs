//! Ingestion endpoint: validate batch, store, cache, publish.
//!
//! The handler follows the usual state-extracted pattern (returning a
//! JSON envelope) layered behind a tier gate, wired into a
//! store-then-cache-then-publish pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{self, ApiIdentity, IdentityTable, Tier};
use crate::broker::Broker;
use crate::context::{AppError, RequestId};
use crate::model::{self, PriceObservation};
use crate::store::Store;

pub const MAX_BATCH_SIZE: usize = 100;
/// Maximum allowed difference between an observation's client-supplied
/// timestamp and the server clock at ingestion time, either direction.
pub const MAX_TIMESTAMP_SKEW: ChronoDuration = ChronoDuration::hours(24);

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub feeds: Vec<PriceObservation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub ingested: usize,
    pub failed: usize,
    pub latency_ms: i64,
    pub message: String,
}

#[derive(Clone)]
pub struct IngestState {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub identities: Arc<IdentityTable>,
    pub cache_latest_ttl_s: u64,
}

pub async fn ingest_handler(
    State(state): State<IngestState>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<ApiIdentity>,
    Json(body): Json<IngestRequest>,
) -> Response {
    match ingest(&state, &identity, body).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response_with_id(&request_id.0),
    }
}

/// Validates and ingests a batch, returning `{inserted_count, failed_count,
/// latency_ms}` or an error. Restricted to `internal`/`admin` identities;
/// callers should have already applied [`auth::require_tier`] before
/// reaching this function — it is re-checked here so the contract holds
/// even for direct (non-HTTP) callers such as tests.
pub async fn ingest(
    state: &IngestState,
    identity: &ApiIdentity,
    body: IngestRequest,
) -> Result<IngestResponse, AppError> {
    auth::require_tier(identity, &[Tier::Internal, Tier::Admin])?;

    let start = Instant::now();
    let now = Utc::now();
    let submitted = body.feeds.len();

    if body.feeds.is_empty() || body.feeds.len() > MAX_BATCH_SIZE {
        metrics::counter!(crate::metrics_registry::INGEST_DROPPED).increment(submitted as u64);
        return Err(AppError::Validation {
            field: "feeds".to_string(),
            reason: format!("must contain between 1 and {MAX_BATCH_SIZE} observations"),
        });
    }

    let mut canonical = Vec::with_capacity(body.feeds.len());
    for obs in body.feeds {
        let obs = model::canonicalize(obs);
        model::validate(&obs).map_err(|e| {
            metrics::counter!(crate::metrics_registry::INGEST_DROPPED).increment(submitted as u64);
            AppError::Validation {
                field: e.field,
                reason: e.reason,
            }
        })?;
        if obs.timestamp < now - MAX_TIMESTAMP_SKEW || obs.timestamp > now + MAX_TIMESTAMP_SKEW {
            metrics::counter!(crate::metrics_registry::INGEST_DROPPED).increment(submitted as u64);
            return Err(AppError::Validation {
                field: "timestamp".to_string(),
                reason: "must be within 24h of server time".to_string(),
            });
        }
        canonical.push(obs);
    }

    let mut to_insert = Vec::with_capacity(canonical.len());
    for mut obs in canonical {
        obs.ingested_at = Some(now);
        to_insert.push(obs);
    }

    let inserted = state
        .store
        .insert_batch(&to_insert)
        .await
        .map_err(|e| {
            warn!(error = %e, "ingestion store write failed");
            metrics::counter!(crate::metrics_registry::INGEST_DROPPED).increment(submitted as u64);
            AppError::StoreError
        })?;

    // Retain, per symbol, only the observation with the greatest timestamp,
    // for the cache write-back and the fan-out publish. Cache and broker
    // failures are warn-level and non-fatal.
    let mut latest_per_symbol: HashMap<String, &PriceObservation> = HashMap::new();
    for obs in &to_insert {
        latest_per_symbol
            .entry(obs.symbol.clone())
            .and_modify(|existing| {
                if obs.timestamp > existing.timestamp {
                    *existing = obs;
                }
            })
            .or_insert(obs);
    }

    for (symbol, obs) in &latest_per_symbol {
        let Ok(payload) = serde_json::to_string(obs) else {
            continue;
        };

        let cache_key = format!("latest:{symbol}");
        if let Err(e) = state
            .broker
            .set_ex(&cache_key, &payload, state.cache_latest_ttl_s)
            .await
        {
            warn!(symbol, error = %e, "failed to write latest cache entry");
            metrics::counter!("cache_write_failures_total").increment(1);
        }

        if let Err(e) = state
            .broker
            .publish(&format!("price_updates:{symbol}"), &payload)
            .await
        {
            warn!(symbol, error = %e, "failed to publish price update");
            metrics::counter!(crate::metrics_registry::BROKER_PUBLISH_FAILURES).increment(1);
        }
        if let Err(e) = state.broker.publish("price_updates:all", &payload).await {
            warn!(symbol, error = %e, "failed to publish price update to price_updates:all");
            metrics::counter!(crate::metrics_registry::BROKER_PUBLISH_FAILURES).increment(1);
        }
    }

    metrics::counter!(crate::metrics_registry::INGEST_RECEIVED).increment(to_insert.len() as u64);
    metrics::counter!(crate::metrics_registry::INGEST_INSERTED).increment(inserted as u64);

    Ok(IngestResponse {
        status: "success",
        ingested: inserted,
        failed: 0,
        latency_ms: start.elapsed().as_millis() as i64,
        message: "ok".to_string(),
    })
}
