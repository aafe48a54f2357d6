//! SQLite-backed [`Store`] implementation.
//!
//! WAL pragmas, prepared statements, and transactional batch insert via
//! `rusqlite`, built on a small fixed-size round-robin connection pool so
//! concurrent ingestion requests don't serialize on a single connection.
//! `rusqlite` has no native async pool, so the pool is a `VecDeque` behind
//! a semaphore.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::info;

use super::{AggregatedPrice, Ohlcv, Store, StoreError, MAX_RANGE_LIMIT};
use crate::model::PriceObservation;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    price TEXT NOT NULL,
    volume TEXT,
    source TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    worker_id TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    ingested_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_observations_symbol_timestamp
    ON observations(symbol, timestamp_ms DESC);

CREATE TABLE IF NOT EXISTS aggregated_prices (
    symbol TEXT NOT NULL,
    price TEXT NOT NULL,
    median TEXT NOT NULL,
    mean TEXT NOT NULL,
    std_dev TEXT,
    num_sources INTEGER NOT NULL,
    sources_json TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_aggregated_prices_symbol_timestamp
    ON aggregated_prices(symbol, timestamp_ms DESC);
"#;

pub struct SqliteStore {
    connections: Arc<Mutex<VecDeque<Connection>>>,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl SqliteStore {
    pub fn open(db_path: &str, pool_size: usize, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let mut pool = VecDeque::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
            let conn = Connection::open_with_flags(db_path, flags)?;
            conn.execute_batch(SCHEMA_SQL)?;
            pool.push_back(conn);
        }

        let store = Self {
            connections: Arc::new(Mutex::new(pool)),
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            acquire_timeout,
        };
        store.assert_required_index()?;
        info!(db_path, pool_size, "sqlite store initialized");
        Ok(store)
    }

    /// Fails fast at boot if the required `(symbol, timestamp DESC)` index
    /// is missing.
    fn assert_required_index(&self) -> anyhow::Result<()> {
        let conn = self.connections.lock();
        let conn = conn.front().expect("pool has at least one connection");
        let mut stmt = conn.prepare("PRAGMA index_list(observations)")?;
        let mut rows = stmt.query([])?;
        let mut found = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "idx_observations_symbol_timestamp" {
                found = true;
                break;
            }
        }
        if !found {
            anyhow::bail!(
                "fatal configuration error: required index idx_observations_symbol_timestamp is missing"
            );
        }
        Ok(())
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::time::timeout(self.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| StoreError::PoolExhausted)?
            .map_err(|_| StoreError::PoolExhausted)?;

        let connections = self.connections.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = connections.lock().pop_front();
            let conn = match conn {
                Some(c) => c,
                None => return Err(StoreError::PoolExhausted),
            };
            let result = f(&conn);
            connections.lock().push_back(conn);
            result
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        drop(permit);
        result
    }
}

fn row_to_observation(row: &rusqlite::Row) -> rusqlite::Result<PriceObservation> {
    let price_str: String = row.get("price")?;
    let volume_str: Option<String> = row.get("volume")?;
    let metadata_json: String = row.get("metadata_json")?;
    let timestamp_ms: i64 = row.get("timestamp_ms")?;
    let ingested_at_ms: i64 = row.get("ingested_at_ms")?;
    let id: String = row.get("id")?;

    Ok(PriceObservation {
        id: Some(id),
        symbol: row.get("symbol")?,
        price: Decimal::from_str(&price_str).unwrap_or_default(),
        volume: volume_str.and_then(|s| Decimal::from_str(&s).ok()),
        source: row.get("source")?,
        timestamp: Utc.timestamp_millis_opt(timestamp_ms).single().unwrap_or_else(Utc::now),
        worker_id: row.get("worker_id")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        ingested_at: Some(
            Utc.timestamp_millis_opt(ingested_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
        ),
    })
}

fn row_to_aggregate(row: &rusqlite::Row) -> rusqlite::Result<AggregatedPrice> {
    let price_str: String = row.get("price")?;
    let median_str: String = row.get("median")?;
    let mean_str: String = row.get("mean")?;
    let std_dev_str: Option<String> = row.get("std_dev")?;
    let sources_json: String = row.get("sources_json")?;
    let num_sources: i64 = row.get("num_sources")?;
    let timestamp_ms: i64 = row.get("timestamp_ms")?;

    let sources: BTreeSet<String> = serde_json::from_str(&sources_json).unwrap_or_default();

    Ok(AggregatedPrice {
        symbol: row.get("symbol")?,
        price: Decimal::from_str(&price_str).unwrap_or_default(),
        median: Decimal::from_str(&median_str).unwrap_or_default(),
        mean: Decimal::from_str(&mean_str).unwrap_or_default(),
        std_dev: std_dev_str.and_then(|s| Decimal::from_str(&s).ok()),
        num_sources: num_sources as usize,
        timestamp: Utc.timestamp_millis_opt(timestamp_ms).single().unwrap_or_else(Utc::now),
        sources,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_batch(&self, obs: &[PriceObservation]) -> Result<usize, StoreError> {
        let obs = obs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut inserted = 0usize;
            for o in &obs {
                let id = crate::model::new_observation_id().to_string();
                let metadata_json = serde_json::to_string(&o.metadata).unwrap_or_default();
                let ingested_at_ms = o
                    .ingested_at
                    .unwrap_or_else(Utc::now)
                    .timestamp_millis();
                tx.execute(
                    "INSERT INTO observations
                     (id, symbol, price, volume, source, timestamp_ms, worker_id, metadata_json, ingested_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        o.symbol,
                        o.price.to_string(),
                        o.volume.map(|v| v.to_string()),
                        o.source,
                        o.timestamp.timestamp_millis(),
                        o.worker_id,
                        metadata_json,
                        ingested_at_ms,
                    ],
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
                inserted += 1;
            }
            tx.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(inserted)
        })
        .await
    }

    async fn latest(&self, symbol: &str) -> Result<Option<PriceObservation>, StoreError> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM observations WHERE symbol = ?1
                     ORDER BY timestamp_ms DESC, ingested_at_ms DESC, rowid DESC LIMIT 1",
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query(params![symbol])
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            match rows.next().map_err(|e| StoreError::Backend(e.to_string()))? {
                Some(row) => Ok(Some(
                    row_to_observation(row).map_err(|e| StoreError::Backend(e.to_string()))?,
                )),
                None => Ok(None),
            }
        })
        .await
    }

    async fn latest_many(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, PriceObservation>, StoreError> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let symbols = symbols.to_vec();
        self.with_conn(move |conn| {
            let placeholders = symbols.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT * FROM observations WHERE symbol IN ({placeholders})
                 ORDER BY symbol, timestamp_ms DESC, ingested_at_ms DESC, rowid DESC"
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query(params_from_iter(symbols.iter()))
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut out: HashMap<String, PriceObservation> = HashMap::new();
            while let Some(row) = rows.next().map_err(|e| StoreError::Backend(e.to_string()))? {
                let obs = row_to_observation(row).map_err(|e| StoreError::Backend(e.to_string()))?;
                // First row per symbol (due to ORDER BY) is the latest; skip
                // subsequent rows for the same symbol.
                out.entry(obs.symbol.clone()).or_insert(obs);
            }
            Ok(out)
        })
        .await
    }

    async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PriceObservation>, StoreError> {
        if limit > MAX_RANGE_LIMIT {
            return Err(StoreError::LimitTooLarge(limit));
        }
        let symbol = symbol.to_string();
        let source = source.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let (sql, params): (&str, Vec<Box<dyn rusqlite::ToSql>>) = if let Some(source) = &source {
                (
                    "SELECT * FROM observations
                     WHERE symbol = ?1 AND timestamp_ms BETWEEN ?2 AND ?3 AND source = ?4
                     ORDER BY timestamp_ms DESC LIMIT ?5",
                    vec![
                        Box::new(symbol.clone()),
                        Box::new(from.timestamp_millis()),
                        Box::new(to.timestamp_millis()),
                        Box::new(source.clone()),
                        Box::new(limit as i64),
                    ],
                )
            } else {
                (
                    "SELECT * FROM observations
                     WHERE symbol = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
                     ORDER BY timestamp_ms DESC LIMIT ?4",
                    vec![
                        Box::new(symbol.clone()),
                        Box::new(from.timestamp_millis()),
                        Box::new(to.timestamp_millis()),
                        Box::new(limit as i64),
                    ],
                )
            };

            let mut stmt = conn.prepare(sql).map_err(|e| StoreError::Backend(e.to_string()))?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt
                .query(param_refs.as_slice())
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| StoreError::Backend(e.to_string()))? {
                out.push(row_to_observation(row).map_err(|e| StoreError::Backend(e.to_string()))?);
            }
            Ok(out)
        })
        .await
    }

    async fn stats(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Ohlcv>, StoreError> {
        // open = earliest row's price, close = latest row's price; fetched
        // via the full ordered set rather than min/max(timestamp) subqueries
        // to keep the logic readable for the expected small window sizes.
        let rows = self.range(symbol, from, to, None, MAX_RANGE_LIMIT).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        // `rows` is DESC by timestamp: first = close, last = open.
        let close = rows.first().unwrap().price;
        let open = rows.last().unwrap().price;
        let high = rows.iter().map(|r| r.price).max().unwrap();
        let low = rows.iter().map(|r| r.price).min().unwrap();
        let volume = rows
            .iter()
            .filter_map(|r| r.volume)
            .fold(Decimal::ZERO, |acc, v| acc + v);
        Ok(Some(Ohlcv {
            open,
            high,
            low,
            close,
            volume,
            num_feeds: rows.len() as i64,
        }))
    }

    async fn latest_aggregate(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AggregatedPrice>, StoreError> {
        let symbol = symbol.to_string();
        let at_ms = at.timestamp_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM aggregated_prices WHERE symbol = ?1 AND timestamp_ms <= ?2
                     ORDER BY timestamp_ms DESC LIMIT 1",
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut rows = stmt
                .query(params![symbol, at_ms])
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            match rows.next().map_err(|e| StoreError::Backend(e.to_string()))? {
                Some(row) => Ok(Some(
                    row_to_aggregate(row).map_err(|e| StoreError::Backend(e.to_string()))?,
                )),
                None => Ok(None),
            }
        })
        .await
    }

    async fn ping(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    fn obs(symbol: &str, source: &str, price: Decimal, ts: DateTime<Utc>) -> PriceObservation {
        PriceObservation {
            id: None,
            symbol: symbol.to_string(),
            price,
            volume: Some(dec!(1)),
            source: source.to_string(),
            timestamp: ts,
            worker_id: "w-1".to_string(),
            metadata: Default::default(),
            ingested_at: Some(ts),
        }
    }

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap(), 2, Duration::from_secs(5)).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn insert_and_latest_roundtrip() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .insert_batch(&[obs("BTC/USD", "coinbase", dec!(67234.56), now)])
            .await
            .unwrap();
        let latest = store.latest("BTC/USD").await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(67234.56));
        assert_eq!(latest.source, "coinbase");
    }

    #[tokio::test]
    async fn latest_picks_highest_timestamp() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .insert_batch(&[
                obs("BTC/USD", "coinbase", dec!(100), now - ChronoDuration::seconds(10)),
                obs("BTC/USD", "kraken", dec!(200), now),
            ])
            .await
            .unwrap();
        let latest = store.latest("BTC/USD").await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(200));
    }

    #[tokio::test]
    async fn range_respects_window_and_limit() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        for i in 0..5 {
            store
                .insert_batch(&[obs(
                    "BTC/USD",
                    "coinbase",
                    Decimal::from(i),
                    now - ChronoDuration::seconds(i),
                )])
                .await
                .unwrap();
        }
        let rows = store
            .range("BTC/USD", now - ChronoDuration::seconds(2), now, None, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn range_rejects_limit_beyond_ceiling() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let err = store
            .range("BTC/USD", now, now, None, MAX_RANGE_LIMIT + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LimitTooLarge(_)));
    }

    #[tokio::test]
    async fn stats_computes_ohlcv_over_window() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .insert_batch(&[
                obs("BTC/USD", "coinbase", dec!(100), now - ChronoDuration::seconds(2)),
                obs("BTC/USD", "kraken", dec!(150), now - ChronoDuration::seconds(1)),
                obs("BTC/USD", "binance", dec!(120), now),
            ])
            .await
            .unwrap();
        let stats = store
            .stats("BTC/USD", now - ChronoDuration::seconds(10), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.open, dec!(100));
        assert_eq!(stats.close, dec!(120));
        assert_eq!(stats.high, dec!(150));
        assert_eq!(stats.low, dec!(100));
        assert_eq!(stats.num_feeds, 3);
    }

    #[tokio::test]
    async fn stats_is_none_for_empty_window() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let stats = store.stats("BTC/USD", now, now).await.unwrap();
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn latest_aggregate_is_none_without_a_precomputed_row() {
        let (store, _dir) = temp_store().await;
        let agg = store.latest_aggregate("BTC/USD", Utc::now()).await.unwrap();
        assert!(agg.is_none());
    }

    #[tokio::test]
    async fn latest_aggregate_roundtrips_an_inserted_row() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let sources_json = serde_json::to_string(&["binance", "kraken"]).unwrap();
        store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO aggregated_prices
                     (symbol, price, median, mean, std_dev, num_sources, sources_json, timestamp_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        "BTC/USD",
                        "67250",
                        "67250",
                        "67250",
                        Option::<String>::None,
                        2i64,
                        sources_json,
                        now.timestamp_millis(),
                    ],
                )
                .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .await
            .unwrap();

        let agg = store
            .latest_aggregate("BTC/USD", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.median, dec!(67250));
        assert_eq!(agg.num_sources, 2);

        let miss = store
            .latest_aggregate("BTC/USD", now - ChronoDuration::seconds(10))
            .await
            .unwrap();
        assert!(miss.is_none());
    }
}
