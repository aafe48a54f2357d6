//! Real-time price-feed aggregation service: HTTP ingestion, cache-first
//! queries, consensus aggregation, and WebSocket fan-out.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::http::Method;
use axum::middleware as axum_mw;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricefeed_backend::auth::{IdentityTable, RateLimiter};
use pricefeed_backend::broker::RedisBroker;
use pricefeed_backend::config::Config;
use pricefeed_backend::context::request_context;
use pricefeed_backend::health::{health_check, HealthState};
use pricefeed_backend::ingest::{ingest_handler, IngestState};
use pricefeed_backend::metrics_registry::{self, metrics_handler};
use pricefeed_backend::query::QueryService;
use pricefeed_backend::routes::{consensus_handler, latest_handler, range_handler, ReadState};
use pricefeed_backend::store::SqliteStore;
use pricefeed_backend::subscription::{stream_handler, SessionTable, SubscriptionState};

mod auth_guard;

/// Process entry flags. Everything here also has an env-var equivalent
/// (`Config::from_env`); these exist for operators who'd rather pass flags
/// than set the process environment.
#[derive(Parser, Debug)]
#[command(name = "pricefeed", about = "Real-time price-feed aggregation service")]
struct Cli {
    /// Path to a TOML file of extra API identities, merged on top of
    /// IDENTITIES_INTERNAL/PUBLIC/ADMIN. Overrides IDENTITIES_PATH if set.
    #[arg(long, env = "IDENTITIES_PATH")]
    config: Option<String>,

    /// Overrides BIND_ADDR's port, keeping the configured host.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("loading configuration")?;

    if let Some(path) = &cli.config {
        config
            .merge_identities_file(path)
            .with_context(|| format!("loading identities file {path}"))?;
    }
    if let Some(port) = cli.port {
        let host = config.bind_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or("0.0.0.0");
        config.bind_addr = format!("{host}:{port}");
    }

    info!(bind_addr = %config.bind_addr, "starting price-feed service");

    let store = Arc::new(
        SqliteStore::open(&config.store_path, config.store_pool_size, config.store_timeout())
            .context("opening store")?,
    );
    let broker = Arc::new(
        RedisBroker::connect(&config.broker_url, config.broker_timeout())
            .await
            .context("connecting to broker")?,
    );
    let identities = Arc::new(IdentityTable::from_config(&config));
    let rate_limiter = Arc::new(RateLimiter::new(broker.clone()));
    let query = Arc::new(QueryService::new(
        store.clone(),
        broker.clone(),
        config.cache_latest_ttl_s,
    ));
    let sessions = Arc::new(SessionTable::new(config.ws_max_connections));

    let metrics_handle = metrics_registry::install().context("installing metrics recorder")?;

    let guard_state = auth_guard::GuardState {
        identities: identities.clone(),
        rate_limiter: rate_limiter.clone(),
    };

    let ingest_routes = Router::new()
        .route("/internal/ingest", post(ingest_handler))
        .with_state(IngestState {
            store: store.clone(),
            broker: broker.clone(),
            identities: identities.clone(),
            cache_latest_ttl_s: config.cache_latest_ttl_s,
        })
        .layer(axum_mw::from_fn_with_state(
            guard_state.clone(),
            auth_guard::require_authenticated,
        ));

    let read_routes = Router::new()
        .route("/prices/latest", get(latest_handler))
        .route("/prices/range", get(range_handler))
        .route("/aggregates/consensus", get(consensus_handler))
        .with_state(ReadState {
            query: query.clone(),
            cache_latest_ttl_s: config.cache_latest_ttl_s,
        })
        .layer(axum_mw::from_fn_with_state(
            guard_state.clone(),
            auth_guard::require_authenticated,
        ));

    let stream_routes = Router::new()
        .route("/stream", get(stream_handler))
        .with_state(SubscriptionState {
            broker: broker.clone(),
            sessions: sessions.clone(),
            heartbeat_interval: config.ws_heartbeat_interval(),
        })
        .layer(axum_mw::from_fn_with_state(
            guard_state.clone(),
            auth_guard::require_authenticated,
        ));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .with_state(HealthState {
            store: store.clone(),
            broker: broker.clone(),
            sessions: sessions.clone(),
            started_at: Instant::now(),
        });

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .merge(ingest_routes)
        .merge(read_routes)
        .merge(stream_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(axum_mw::from_fn(request_context))
        .layer(cors);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(bind_addr = %config.bind_addr, "listening");

    axum::serve(listener, app).await.context("server exited")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pricefeed_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
