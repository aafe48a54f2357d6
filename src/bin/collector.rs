//! Standalone collector worker process: runs one [`Collector`] for a
//! configured exchange, feeding the shared ingestion HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricefeed_backend::collector::{BatcherConfig, Collector, CollectorConfig, HttpSender, ReconnectPolicy};
use pricefeed_backend::exchanges::{builtin_adapters, SymbolAliases};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let ingest_url = std::env::var("INGEST_URL").unwrap_or_else(|_| {
        "http://127.0.0.1:3000/internal/ingest".to_string()
    });
    let api_key = std::env::var("COLLECTOR_API_KEY").context("COLLECTOR_API_KEY must be set")?;
    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| "collector-1".to_string());
    let exchange = std::env::var("EXCHANGE").unwrap_or_else(|_| "coinbase".to_string());
    let symbols: Vec<String> = std::env::var("SYMBOLS")
        .unwrap_or_else(|_| "BTC/USD,ETH/USD".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let aliases = SymbolAliases::with_overrides(Default::default());
    let mut adapters = builtin_adapters(&aliases);
    let adapter = adapters
        .remove(exchange.as_str())
        .with_context(|| format!("no adapter registered for exchange {exchange:?}"))?;

    let http_client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;
    let sender = HttpSender::new(http_client, ingest_url, api_key);

    let config = CollectorConfig {
        worker_id: worker_id.clone(),
        symbols: symbols.clone(),
        batcher: BatcherConfig::default(),
        reconnect: ReconnectPolicy::default(),
    };

    info!(worker_id = %worker_id, exchange, ?symbols, "starting collector");

    let collector = Collector::new(config, adapter, sender);
    let shutdown = Arc::new(Notify::new());

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });

    collector.run(shutdown).await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pricefeed_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
