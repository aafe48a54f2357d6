//! Query plane: cache-first latest reads, range/OHLCV queries, and
//! multi-source consensus aggregation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::Broker;
use crate::model::PriceObservation;
pub use crate::store::AggregatedPrice;
use crate::store::Store;

/// Supported OHLCV bucket widths. A requested interval returns a single
/// aggregate bucket over the whole `[from, to]` window rather than a
/// multi-bucket series; the response always echoes which interval (if
/// any) was applied so callers can tell the two response shapes apart.
pub const SUPPORTED_INTERVALS: &[&str] = &["1m", "5m", "15m", "30m", "1h", "4h", "1d"];

pub const CONSENSUS_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

#[derive(Debug, Clone, Serialize)]
pub struct LatestRow {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Option<Decimal>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub staleness_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestResponse {
    pub data: Vec<LatestRow>,
    pub cached: bool,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub num_feeds: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeResponse {
    pub data: Vec<OhlcvRow>,
    pub interval: Option<String>,
    pub count: usize,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResponse {
    pub data: Vec<AggregatedPrice>,
    pub latency_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub struct QueryService {
    store: Arc<dyn Store>,
    broker: Arc<dyn Broker>,
    cache_latest_ttl_s: u64,
}

impl QueryService {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>, cache_latest_ttl_s: u64) -> Self {
        Self {
            store,
            broker,
            cache_latest_ttl_s,
        }
    }

    /// Cache-first read of the latest observation for each requested
    /// symbol. `cached` is true iff every symbol was served from cache.
    pub async fn latest(&self, symbols: &[String]) -> Result<LatestResponse, QueryError> {
        let start = Instant::now();
        let mut deduped: Vec<String> = Vec::new();
        for s in symbols {
            if !deduped.contains(s) {
                deduped.push(s.clone());
            }
        }

        let mut rows: Vec<LatestRow> = Vec::with_capacity(deduped.len());
        let mut misses: Vec<String> = Vec::new();
        let mut all_cached = true;

        for symbol in &deduped {
            let cache_key = format!("latest:{symbol}");
            match self.broker.get(&cache_key).await {
                Ok(Some(raw)) => match serde_json::from_str::<PriceObservation>(&raw) {
                    Ok(obs) => {
                        metrics::counter!(crate::metrics_registry::CACHE_HITS).increment(1);
                        rows.push(to_latest_row(&obs));
                    }
                    Err(_) => {
                        metrics::counter!(crate::metrics_registry::CACHE_MISSES).increment(1);
                        misses.push(symbol.clone());
                        all_cached = false;
                    }
                },
                Ok(None) => {
                    metrics::counter!(crate::metrics_registry::CACHE_MISSES).increment(1);
                    misses.push(symbol.clone());
                    all_cached = false;
                }
                Err(e) => {
                    warn!(symbol, error = %e, "cache read failed on query path, falling through to store");
                    metrics::counter!(crate::metrics_registry::CACHE_MISSES).increment(1);
                    misses.push(symbol.clone());
                    all_cached = false;
                }
            }
        }

        if !misses.is_empty() {
            let fetched = self.store.latest_many(&misses).await?;
            for (symbol, obs) in &fetched {
                rows.push(to_latest_row(obs));
                let cache_key = format!("latest:{symbol}");
                if let Ok(payload) = serde_json::to_string(obs) {
                    if let Err(e) = self
                        .broker
                        .set_ex(&cache_key, &payload, self.cache_latest_ttl_s)
                        .await
                    {
                        warn!(symbol, error = %e, "failed to write latest-value cache back");
                    }
                }
            }
        }

        Ok(LatestResponse {
            data: rows,
            cached: all_cached,
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }

    /// Raw range query, or a single-bucket OHLCV approximation when
    /// `interval` is supplied.
    #[allow(clippy::too_many_arguments)]
    pub async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Option<&str>,
        source: Option<&str>,
        limit: usize,
    ) -> Result<RangeResponse, QueryError> {
        let start = Instant::now();
        let cache_key = format!(
            "range:{}:{}:{}:{}",
            symbol,
            from.timestamp_millis(),
            to.timestamp_millis(),
            interval.unwrap_or("raw")
        );

        if let Ok(Some(raw)) = self.broker.get(&cache_key).await {
            if let Ok(mut cached) = serde_json::from_str::<RangeResponse>(&raw) {
                cached.latency_ms = start.elapsed().as_millis() as i64;
                return Ok(cached);
            }
        }

        let response = if let Some(interval) = interval {
            let stats = self.store.stats(symbol, from, to).await?;
            let data = match stats {
                Some(s) => vec![OhlcvRow {
                    symbol: symbol.to_string(),
                    open: s.open,
                    high: s.high,
                    low: s.low,
                    close: s.close,
                    volume: s.volume,
                    num_feeds: s.num_feeds,
                    timestamp: to,
                }],
                None => Vec::new(),
            };
            RangeResponse {
                count: data.len(),
                data,
                interval: Some(interval.to_string()),
                latency_ms: 0,
            }
        } else {
            let rows = self.store.range(symbol, from, to, source, limit).await?;
            let data: Vec<OhlcvRow> = rows
                .into_iter()
                .map(|o| OhlcvRow {
                    symbol: o.symbol.clone(),
                    open: o.price,
                    high: o.price,
                    low: o.price,
                    close: o.price,
                    volume: o.volume.unwrap_or(Decimal::ZERO),
                    num_feeds: 1,
                    timestamp: o.timestamp,
                })
                .collect();
            RangeResponse {
                count: data.len(),
                data,
                interval: None,
                latency_ms: 0,
            }
        };

        if let Ok(payload) = serde_json::to_string(&response) {
            let _ = self.broker.set_ex(&cache_key, &payload, 300).await;
        }

        Ok(RangeResponse {
            latency_ms: start.elapsed().as_millis() as i64,
            ..response
        })
    }

    pub async fn consensus(
        &self,
        symbols: &[String],
        at: DateTime<Utc>,
        cache_ttl_s: u64,
    ) -> Result<ConsensusResponse, QueryError> {
        let start = Instant::now();
        let mut data = Vec::new();

        for symbol in symbols {
            let cache_key = format!("consensus:{}:{}", symbol, at.timestamp_millis());
            if let Ok(Some(raw)) = self.broker.get(&cache_key).await {
                if let Ok(agg) = serde_json::from_str::<AggregatedPrice>(&raw) {
                    data.push(agg);
                    continue;
                }
            }

            if let Some(precomputed) = self.store.latest_aggregate(symbol, at).await? {
                if let Ok(payload) = serde_json::to_string(&precomputed) {
                    let _ = self.broker.set_ex(&cache_key, &payload, cache_ttl_s).await;
                }
                data.push(precomputed);
                continue;
            }

            let window_start = at - CONSENSUS_WINDOW;
            let rows = self
                .store
                .range(symbol, window_start, at, None, crate::store::MAX_RANGE_LIMIT)
                .await?;
            if rows.is_empty() {
                continue;
            }

            let agg = aggregate(symbol, &rows);
            if let Ok(payload) = serde_json::to_string(&agg) {
                let _ = self.broker.set_ex(&cache_key, &payload, cache_ttl_s).await;
            }
            data.push(agg);
        }

        Ok(ConsensusResponse {
            data,
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }
}

fn to_latest_row(obs: &PriceObservation) -> LatestRow {
    let staleness_ms = (Utc::now() - obs.timestamp).num_milliseconds().max(0);
    LatestRow {
        symbol: obs.symbol.clone(),
        price: obs.price,
        volume: obs.volume,
        source: obs.source.clone(),
        timestamp: obs.timestamp,
        staleness_ms,
    }
}

/// Computes the consensus aggregate for one symbol's rows in a window:
/// median via linear-interpolated 50th percentile, sample standard
/// deviation (`None` below two sources), sources as a sorted set.
fn aggregate(symbol: &str, rows: &[PriceObservation]) -> AggregatedPrice {
    let mut prices: Vec<Decimal> = rows.iter().map(|r| r.price).collect();
    prices.sort();

    let median = percentile_50(&prices);
    let mean = prices.iter().copied().sum::<Decimal>() / Decimal::from(prices.len());

    let sources: BTreeSet<String> = rows.iter().map(|r| r.source.clone()).collect();
    let num_sources = sources.len();

    let std_dev = if num_sources >= 2 {
        let mean_f = mean.to_f64().unwrap_or(0.0);
        let variance = prices
            .iter()
            .map(|p| {
                let diff = p.to_f64().unwrap_or(0.0) - mean_f;
                diff * diff
            })
            .sum::<f64>()
            / (prices.len() as f64 - 1.0);
        Decimal::try_from(variance.sqrt()).ok()
    } else {
        None
    };

    let timestamp = rows.iter().map(|r| r.timestamp).max().unwrap();

    AggregatedPrice {
        symbol: symbol.to_string(),
        price: median,
        median,
        mean,
        std_dev,
        num_sources,
        timestamp,
        sources,
    }
}

/// 50th percentile via linear interpolation over an already-sorted slice.
fn percentile_50(sorted: &[Decimal]) -> Decimal {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let n = sorted.len();
    let mid = (n - 1) as f64 * 0.5;
    let lower = mid.floor() as usize;
    let upper = mid.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let frac = Decimal::try_from(mid - lower as f64).unwrap_or(Decimal::ZERO);
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn obs(source: &str, price: Decimal, ts: DateTime<Utc>) -> PriceObservation {
        PriceObservation {
            id: None,
            symbol: "BTC/USD".to_string(),
            price,
            volume: None,
            source: source.to_string(),
            timestamp: ts,
            worker_id: "w".to_string(),
            metadata: Default::default(),
            ingested_at: Some(ts),
        }
    }

    #[test]
    fn aggregate_computes_median_mean_and_sources() {
        let now = Utc::now();
        let rows = vec![
            obs("binance", dec!(67200), now),
            obs("kraken", dec!(67250), now),
            obs("coinbase", dec!(67300), now),
        ];
        let agg = aggregate("BTC/USD", &rows);
        assert_eq!(agg.num_sources, 3);
        assert_eq!(agg.median, dec!(67250));
        assert_eq!(agg.price, dec!(67250));
        assert_eq!(
            agg.sources,
            ["binance", "coinbase", "kraken"]
                .into_iter()
                .map(String::from)
                .collect()
        );
        assert!(agg.std_dev.is_some());
    }

    #[test]
    fn aggregate_single_source_has_no_std_dev() {
        let now = Utc::now();
        let rows = vec![obs("binance", dec!(100), now)];
        let agg = aggregate("BTC/USD", &rows);
        assert_eq!(agg.num_sources, 1);
        assert!(agg.std_dev.is_none());
    }

    #[test]
    fn percentile_50_interpolates_even_counts() {
        let sorted = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(percentile_50(&sorted), dec!(2.5));
    }

    use crate::broker::{Broker, BrokerError, BrokerSubscription};
    use crate::store::{Ohlcv, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        precomputed: Option<AggregatedPrice>,
        range_rows: Vec<PriceObservation>,
    }

    #[async_trait]
    impl crate::store::Store for FakeStore {
        async fn insert_batch(&self, _obs: &[PriceObservation]) -> Result<usize, StoreError> {
            unimplemented!("not exercised by this test")
        }
        async fn latest(&self, _symbol: &str) -> Result<Option<PriceObservation>, StoreError> {
            unimplemented!("not exercised by this test")
        }
        async fn latest_many(
            &self,
            _symbols: &[String],
        ) -> Result<HashMap<String, PriceObservation>, StoreError> {
            unimplemented!("not exercised by this test")
        }
        async fn range(
            &self,
            _symbol: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _source: Option<&str>,
            _limit: usize,
        ) -> Result<Vec<PriceObservation>, StoreError> {
            Ok(self.range_rows.clone())
        }
        async fn stats(
            &self,
            _symbol: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Option<Ohlcv>, StoreError> {
            unimplemented!("not exercised by this test")
        }
        async fn latest_aggregate(
            &self,
            _symbol: &str,
            _at: DateTime<Utc>,
        ) -> Result<Option<AggregatedPrice>, StoreError> {
            Ok(self.precomputed.clone())
        }
        async fn ping(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeBroker {
        values: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }
        async fn set_ex(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<(), BrokerError> {
            self.values.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn incr_with_expiry(&self, _key: &str, _ttl_secs: u64) -> Result<i64, BrokerError> {
            Ok(1)
        }
        async fn ttl_secs(&self, _key: &str) -> Result<Option<i64>, BrokerError> {
            Ok(Some(60))
        }
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn subscribe(&self, _channel: &str) -> Result<BrokerSubscription, BrokerError> {
            unimplemented!("not exercised by this test")
        }
        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn consensus_prefers_a_precomputed_store_aggregate_over_on_demand() {
        let now = Utc::now();
        let precomputed = AggregatedPrice {
            symbol: "BTC/USD".to_string(),
            price: dec!(99999),
            median: dec!(99999),
            mean: dec!(99999),
            std_dev: None,
            num_sources: 1,
            timestamp: now,
            sources: ["precomputed".to_string()].into_iter().collect(),
        };
        let store = Arc::new(FakeStore {
            precomputed: Some(precomputed.clone()),
            // If consensus() fell through to the on-demand path it would
            // aggregate this row instead, producing a different median.
            range_rows: vec![obs("binance", dec!(1), now)],
        });
        let broker = Arc::new(FakeBroker::default());
        let service = QueryService::new(store, broker, 60);

        let response = service
            .consensus(&["BTC/USD".to_string()], now, 60)
            .await
            .unwrap();

        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0], precomputed);
    }

    #[tokio::test]
    async fn consensus_falls_back_to_on_demand_aggregation_without_a_precomputed_row() {
        let now = Utc::now();
        let store = Arc::new(FakeStore {
            precomputed: None,
            range_rows: vec![
                obs("binance", dec!(67200), now),
                obs("kraken", dec!(67300), now),
            ],
        });
        let broker = Arc::new(FakeBroker::default());
        let service = QueryService::new(store, broker, 60);

        let response = service
            .consensus(&["BTC/USD".to_string()], now, 60)
            .await
            .unwrap();

        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].num_sources, 2);
        assert_eq!(response.data[0].median, dec!(67250));
    }
}
