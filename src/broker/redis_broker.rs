//! Redis-backed [`Broker`]. Maintains three independent logical
//! connections: one `ConnectionManager` for general commands, one for
//! publish, and a dedicated `PubSub` connection per subscribe call.
//!
//! Built on the `redis` crate's own async API (`ConnectionManager`,
//! `aio::PubSub`).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Broker, BrokerError, BrokerSubscription};

pub struct RedisBroker {
    commands: ConnectionManager,
    publisher: ConnectionManager,
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisBroker {
    pub async fn connect(url: &str, command_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            commands,
            publisher,
            client,
            command_timeout,
        })
    }

    async fn with_timeout<F, T>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(BrokerError::Unavailable(e.to_string())),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.commands.clone();
        self.with_timeout(conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        self.with_timeout(conn.set_ex(key, value, ttl_secs)).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> Result<i64, BrokerError> {
        let mut conn = self.commands.clone();
        // INCR then, only on the first hit of a fresh window, EXPIRE.
        let count: i64 = self.with_timeout(conn.incr(key, 1)).await?;
        if count == 1 {
            let _: Result<(), BrokerError> = self
                .with_timeout(conn.expire(key, ttl_secs as i64))
                .await;
        }
        Ok(count)
    }

    async fn ttl_secs(&self, key: &str) -> Result<Option<i64>, BrokerError> {
        let mut conn = self.commands.clone();
        let ttl: i64 = self.with_timeout(conn.ttl(key)).await?;
        Ok(if ttl >= 0 { Some(ttl) } else { None })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        self.with_timeout(conn.publish(channel, payload)).await
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let channel_owned = channel.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: redis::RedisResult<String> = msg.get_payload();
                match payload {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel_owned, error = %e, "broker subscription payload decode failed");
                    }
                }
            }
        });

        Ok(BrokerSubscription::new(rx, handle))
    }

    async fn ping(&self) -> bool {
        let mut conn = self.commands.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }
}
