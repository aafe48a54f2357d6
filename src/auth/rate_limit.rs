//! Fixed-window rate limiter keyed by API key.
//!
//! Broker-backed (`ratelimit:{key}`) fixed 60-second window shared across
//! the whole process fleet, with a fail-open policy when the broker is
//! unreachable. The window/limit/`Retry-After` response shape follows the
//! same contract as the older in-memory per-IP limiter this replaces.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::broker::Broker;

pub const WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch-ms when the current window expires.
    pub reset_at_ms: i64,
    /// Only meaningful when `allowed` is false.
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    broker: Arc<dyn Broker>,
}

impl RateLimiter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Counts one request against `key`'s 60-second window. `limit == 0`
    /// means unlimited and bypasses the counter entirely. On broker failure
    /// the request is allowed (fails open) and the caller should increment
    /// a `rate_limit_backend_unavailable` counter.
    pub async fn check(&self, key: &str, limit: u32) -> RateLimitDecision {
        if limit == 0 {
            return RateLimitDecision {
                allowed: true,
                limit: 0,
                remaining: u32::MAX,
                reset_at_ms: 0,
                retry_after_secs: 0,
            };
        }

        let redis_key = format!("ratelimit:{key}");
        match self.broker.incr_with_expiry(&redis_key, WINDOW_SECS).await {
            Ok(count) => {
                let ttl = self
                    .broker
                    .ttl_secs(&redis_key)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(WINDOW_SECS as i64);
                let reset_at_ms = now_ms() + ttl * 1000;
                let remaining = (limit as i64 - count).max(0) as u32;
                RateLimitDecision {
                    allowed: count <= limit as i64,
                    limit,
                    remaining,
                    reset_at_ms,
                    retry_after_secs: ttl.max(0) as u64,
                }
            }
            Err(e) => {
                warn!(error = %e, "rate limit backend unavailable, failing open");
                metrics::counter!("rate_limit_backend_unavailable").increment(1);
                RateLimitDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at_ms: now_ms() + WINDOW_SECS as i64 * 1000,
                    retry_after_secs: WINDOW_SECS,
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn window_duration() -> Duration {
    Duration::from_secs(WINDOW_SECS)
}
