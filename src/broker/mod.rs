//! Cache + pub/sub broker adapter.
//!
//! The broker is treated as an opaque string-keyed store: callers
//! (query service, ingestion endpoint, rate limiter) own JSON
//! serialization, the broker only moves bytes.

mod redis_broker;

pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker command timed out")]
    Timeout,
}

/// A live channel subscription. Dropping it stops delivery.
pub struct BrokerSubscription {
    pub receiver: mpsc::Receiver<String>,
    _handle: tokio::task::JoinHandle<()>,
}

impl BrokerSubscription {
    pub fn new(receiver: mpsc::Receiver<String>, handle: tokio::task::JoinHandle<()>) -> Self {
        Self {
            receiver,
            _handle: handle,
        }
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Overwrites (never invalidates-then-waits) `key` with `value`,
    /// TTL `ttl_secs`. This is the only write path — there is no separate
    /// invalidate operation.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BrokerError>;

    /// Atomically increments `key`, setting a `ttl_secs` expiry on the
    /// *first* increment of a window (the rate limiter's counter).
    /// Returns the post-increment count.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, BrokerError>;

    /// Seconds remaining until `key` expires, or `None` if it doesn't exist.
    async fn ttl_secs(&self, key: &str) -> Result<Option<i64>, BrokerError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Opens a dedicated subscribe connection for exactly one channel —
    /// the subscribe connection is not reusable for commands.
    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError>;

    async fn ping(&self) -> bool;
}
