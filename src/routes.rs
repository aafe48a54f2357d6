//! HTTP handlers for the read plane: `/prices/latest`, `/prices/range`,
//! and `/aggregates/consensus`. Each uses axum's `Query` extractor plus a
//! shared state handle into the query service.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::{self, ApiIdentity, Tier};
use crate::context::{AppError, RequestId};
use crate::query::QueryService;
use crate::store::MAX_RANGE_LIMIT;

#[derive(Clone)]
pub struct ReadState {
    pub query: Arc<QueryService>,
    pub cache_latest_ttl_s: u64,
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    pub symbols: String,
}

pub async fn latest_handler(
    State(state): State<ReadState>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<ApiIdentity>,
    Query(params): Query<LatestParams>,
) -> Response {
    match latest(&state, &identity, &params.symbols).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response_with_id(&request_id.0),
    }
}

async fn latest(
    state: &ReadState,
    identity: &ApiIdentity,
    symbols_csv: &str,
) -> Result<crate::query::LatestResponse, AppError> {
    auth::require_tier(identity, &[Tier::Public, Tier::Admin])?;
    let symbols = split_symbols(symbols_csv);
    Ok(state.query.latest(&symbols).await?)
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub symbol: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub interval: Option<String>,
    pub source: Option<String>,
    pub limit: Option<usize>,
}

pub async fn range_handler(
    State(state): State<ReadState>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<ApiIdentity>,
    Query(params): Query<RangeParams>,
) -> Response {
    match range(&state, &identity, params).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response_with_id(&request_id.0),
    }
}

async fn range(
    state: &ReadState,
    identity: &ApiIdentity,
    params: RangeParams,
) -> Result<crate::query::RangeResponse, AppError> {
    auth::require_tier(identity, &[Tier::Public, Tier::Admin])?;

    let limit = params.limit.unwrap_or(1000);
    if limit > MAX_RANGE_LIMIT {
        return Err(AppError::Internal(format!(
            "limit {limit} exceeds maximum of {MAX_RANGE_LIMIT}"
        )));
    }
    if let Some(interval) = &params.interval {
        if !crate::query::SUPPORTED_INTERVALS.contains(&interval.as_str()) {
            return Err(AppError::Validation {
                field: "interval".to_string(),
                reason: format!("must be one of {:?}", crate::query::SUPPORTED_INTERVALS),
            });
        }
    }

    Ok(state
        .query
        .range(
            &params.symbol,
            params.from,
            params.to,
            params.interval.as_deref(),
            params.source.as_deref(),
            limit,
        )
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct ConsensusParams {
    pub symbols: String,
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn consensus_handler(
    State(state): State<ReadState>,
    Extension(request_id): Extension<RequestId>,
    Extension(identity): Extension<ApiIdentity>,
    Query(params): Query<ConsensusParams>,
) -> Response {
    match consensus(&state, &identity, params).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response_with_id(&request_id.0),
    }
}

async fn consensus(
    state: &ReadState,
    identity: &ApiIdentity,
    params: ConsensusParams,
) -> Result<crate::query::ConsensusResponse, AppError> {
    auth::require_tier(identity, &[Tier::Public, Tier::Admin])?;
    let symbols = split_symbols(&params.symbols);
    let at = params.timestamp.unwrap_or_else(Utc::now);
    Ok(state
        .query
        .consensus(&symbols, at, state.cache_latest_ttl_s)
        .await?)
}

fn split_symbols(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
