//! Ties one upstream connection, a batcher, and the ingestion HTTP sender
//! together into a single collector task.
//!
//! Grounded in `botfed-crypto-feeds`'s `exchanges/connection.rs`
//! (`listen_with_reconnect`/`connect_and_stream`), generalized over
//! [`crate::exchanges::ExchangeAdapter`] and wired to this service's own
//! batcher and HTTP sender instead of an in-process `MarketDataCollection`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use super::batcher::{Batcher, BatcherConfig};
use super::connection::{ConnectionState, ReconnectPolicy};
use super::sender::{HttpSender, SendOutcome};
use crate::exchanges::{ExchangeAdapter, SubscribeRequest, WireFrame};

pub struct CollectorConfig {
    pub worker_id: String,
    pub symbols: Vec<String>,
    pub batcher: BatcherConfig,
    pub reconnect: ReconnectPolicy,
}

pub struct Collector {
    config: CollectorConfig,
    adapter: Box<dyn ExchangeAdapter>,
    sender: HttpSender,
    state: ConnectionState,
}

impl Collector {
    pub fn new(config: CollectorConfig, adapter: Box<dyn ExchangeAdapter>, sender: HttpSender) -> Self {
        Self {
            config,
            adapter,
            sender,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs until `shutdown` is notified or the reconnect budget is
    /// exhausted (at which point the collector transitions to `Failed` and
    /// returns; it must be externally restarted).
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        let mut batcher = Batcher::new(self.config.batcher.clone());
        let mut attempt: u32 = 0;

        loop {
            if self.config.reconnect.exhausted(attempt) {
                self.state = ConnectionState::Failed;
                error!(worker_id = %self.config.worker_id, "collector exhausted reconnect attempts, giving up");
                return;
            }

            self.state = ConnectionState::Connecting;
            let run_result = tokio::select! {
                _ = shutdown.notified() => {
                    info!(worker_id = %self.config.worker_id, "collector shutting down");
                    self.flush(&mut batcher).await;
                    return;
                }
                res = self.connect_and_stream(&mut batcher, shutdown.clone()) => res,
            };

            match run_result {
                Ok(()) => {
                    // Clean disconnect (e.g. upstream closed normally); retry
                    // from scratch without penalizing the backoff counter.
                    attempt = 0;
                }
                Err(e) => {
                    attempt += 1;
                    self.state = ConnectionState::Reconnecting;
                    let backoff = self.config.reconnect.backoff_for_attempt(attempt);
                    warn!(worker_id = %self.config.worker_id, error = %e, attempt, ?backoff, "collector reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.notified() => {
                            self.flush(&mut batcher).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        batcher: &mut Batcher,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<()> {
        let url = self.adapter.upstream_url(&self.config.symbols);
        let (ws_stream, _) = connect_async(&url).await?;
        self.state = ConnectionState::Open;
        info!(worker_id = %self.config.worker_id, url, "collector connected");

        let (mut write, mut read) = ws_stream.split();

        if let SubscribeRequest::FirstFrame(frame) =
            self.adapter.subscribe_request(&self.config.symbols)
        {
            write.send(WsMessage::Text(frame.into())).await?;
        }

        self.state = ConnectionState::Reading;
        let mut flush_interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                _ = flush_interval.tick() => {
                    if batcher.should_flush() {
                        self.flush(batcher).await;
                    }
                }
                maybe_msg = read.next() => {
                    match maybe_msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(obs) = self.adapter.parse(WireFrame::Text(&text), &self.config.worker_id) {
                                batcher.push(obs);
                                if batcher.should_flush() {
                                    self.flush(batcher).await;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            if let Some(obs) = self.adapter.parse(WireFrame::Binary(&bytes), &self.config.worker_id) {
                                batcher.push(obs);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(anyhow::anyhow!("upstream closed"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn flush(&self, batcher: &mut Batcher) {
        if batcher.is_empty() {
            return;
        }
        let batch = batcher.take_batch();
        match self.sender.send(&self.config.worker_id, &batch).await {
            SendOutcome::Delivered => {}
            SendOutcome::Retryable => batcher.reenqueue_failed(batch),
            SendOutcome::Poison => {
                warn!(worker_id = %self.config.worker_id, count = batch.len(), "dropped poison batch");
            }
        }
    }
}
