//! Shared authentication + rate-limit middleware applied to every
//! authenticated HTTP route: extracts a bearer credential, authenticates
//! it against the identity table, enforces the identity's per-minute
//! limit, and stamps `X-RateLimit-*` response headers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

use pricefeed_backend::auth::{self, extract_credential, ApiIdentity, IdentityTable, RateLimitDecision, RateLimiter};
use pricefeed_backend::context::AppError;

#[derive(Clone)]
pub struct GuardState {
    pub identities: Arc<IdentityTable>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub async fn require_authenticated(
    State(state): State<GuardState>,
    mut request: Request,
    next: Next,
) -> Response {
    let credential = extract_credential(request.headers(), request.uri().query());

    let identity: ApiIdentity = match auth::authenticate(&state.identities, credential.as_deref()) {
        Ok(identity) => identity,
        Err(e) => return e.into_response_with_id(request_id(&request)),
    };

    let decision = state.rate_limiter.check(&identity.key, identity.rate_limit).await;
    if !decision.allowed {
        metrics::counter!(pricefeed_backend::metrics_registry::RATE_LIMIT_REJECTIONS).increment(1);
        let err = AppError::RateLimitExceeded {
            retry_after_secs: decision.retry_after_secs,
        };
        let mut response = err.into_response_with_id(request_id(&request));
        stamp_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    request.extensions_mut().insert(identity);

    let mut response = next.run(request).await;
    stamp_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn stamp_rate_limit_headers(headers: &mut axum::http::HeaderMap, decision: &RateLimitDecision) {
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at_ms.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

fn request_id(request: &Request) -> &str {
    request
        .extensions()
        .get::<pricefeed_backend::context::RequestId>()
        .map(|id| id.0.as_str())
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use pricefeed_backend::broker::{Broker, BrokerError, BrokerSubscription};
    use pricefeed_backend::config::{Config, IdentityConfig};
    use pricefeed_backend::auth::Tier;
    use tower::ServiceExt;

    struct AlwaysOverLimitBroker;

    #[async_trait]
    impl Broker for AlwaysOverLimitBroker {
        async fn get(&self, _key: &str) -> Result<Option<String>, BrokerError> {
            Ok(None)
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn incr_with_expiry(&self, _key: &str, _ttl_secs: u64) -> Result<i64, BrokerError> {
            Ok(2)
        }
        async fn ttl_secs(&self, _key: &str) -> Result<Option<i64>, BrokerError> {
            Ok(Some(30))
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

    fn guard_state() -> GuardState {
        let config = Config {
            bind_addr: "0.0.0.0:0".to_string(),
            store_path: ":memory:".to_string(),
            store_pool_size: 1,
            store_timeout_ms: 1000,
            broker_url: "x".to_string(),
            broker_timeout_ms: 1000,
            cache_latest_ttl_s: 60,
            identities: vec![IdentityConfig {
                key: "rate-limited-key".to_string(),
                tier: Tier::Public,
                rate_limit: 1,
            }],
            rate_limit_internal: 0,
            rate_limit_public_free: 1,
            rate_limit_admin: 0,
            ws_heartbeat_interval_ms: 1,
            ws_max_connections: 1,
            log_level: "info".to_string(),
            symbol_aliases: Default::default(),
            identities_path: None,
        };
        GuardState {
            identities: Arc::new(IdentityTable::from_config(&config)),
            rate_limiter: Arc::new(RateLimiter::new(Arc::new(AlwaysOverLimitBroker))),
        }
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(|| async { StatusCode::OK }))
            .layer(axum::middleware::from_fn_with_state(guard_state(), require_authenticated))
    }

    #[tokio::test]
    async fn rejected_requests_still_carry_rate_limit_headers() {
        let request = HttpRequest::builder()
            .uri("/")
            .header("Authorization", "Bearer rate-limited-key")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(headers.get("x-ratelimit-reset").is_some());
    }
}
