//! Time-series store adapter contract.
//!
//! A relational time-series store sits behind this external collaborator
//! boundary; this crate ships a SQLite-backed adapter behind the
//! [`Store`] trait so the hot path never depends on `rusqlite` directly and
//! a future Postgres/Timescale adapter is a drop-in replacement.

mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PriceObservation;

/// Hard ceiling on `range`'s `limit` parameter. Exceeding it is a programmer
/// error and surfaces as a 500.
pub const MAX_RANGE_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store connection pool exhausted")]
    PoolExhausted,
    #[error("limit {0} exceeds the maximum of {MAX_RANGE_LIMIT}")]
    LimitTooLarge(usize),
    #[error("required index missing on startup: {0}")]
    MissingIndex(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Ohlcv {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub num_feeds: i64,
}

/// A consensus aggregate over a `(symbol, window)`, either computed on
/// demand by the query service or read back from a precomputed store
/// entry via [`Store::latest_aggregate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedPrice {
    pub symbol: String,
    pub price: Decimal,
    pub median: Decimal,
    pub mean: Decimal,
    pub std_dev: Option<Decimal>,
    pub num_sources: usize,
    pub timestamp: DateTime<Utc>,
    pub sources: BTreeSet<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Atomic w.r.t. the provided batch; duplicates are allowed and
    /// preserved (dedup is a query-time concern, not a write-time one).
    async fn insert_batch(&self, obs: &[PriceObservation]) -> Result<usize, StoreError>;

    /// Most recent observation by timestamp; ties broken by highest
    /// `ingested_at` then highest `id`.
    async fn latest(&self, symbol: &str) -> Result<Option<PriceObservation>, StoreError>;

    /// Equivalent to `latest` for each symbol, computed via a single scan.
    async fn latest_many(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, PriceObservation>, StoreError>;

    /// `timestamp in [from, to]`, descending by timestamp, optionally
    /// restricted to one source. `limit` beyond [`MAX_RANGE_LIMIT`] is
    /// rejected.
    async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PriceObservation>, StoreError>;

    /// OHLCV rollup over `[from, to]`; `None` when no observations exist in
    /// the window.
    async fn stats(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Ohlcv>, StoreError>;

    /// Most recent precomputed aggregate for `symbol` with
    /// `timestamp <= at`, if one has been materialized. Returns `None`
    /// when no precomputed row exists, leaving the caller to fall back to
    /// an on-demand aggregation over raw observations.
    async fn latest_aggregate(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AggregatedPrice>, StoreError>;

    /// Lightweight liveness probe for `/health`.
    async fn ping(&self) -> bool;
}
