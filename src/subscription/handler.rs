//! WS upgrade handler and per-connection session loop.
//!
//! Ping/pong framing over a `tokio::select!` covering both a fan-in recv
//! arm and a socket-recv arm, with a per-session map of per-symbol broker
//! subscriptions so a session only ever receives a published message
//! through the one channel it actually asked for.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::broker::{Broker, BrokerSubscription};
use crate::model::is_canonical_symbol;

use super::protocol::{ClientMessage, PriceUpdateData, ServerMessage};
use super::session::SessionTable;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

struct SymbolFeed {
    _sub: BrokerSubscription,
    _forward: JoinHandle<()>,
}

/// Per-connection state: which symbols are live, and the fan-in channel
/// every per-symbol forwarder writes pre-rendered `price_update` JSON into.
struct Session {
    connection_id: uuid::Uuid,
    broker: Arc<dyn Broker>,
    feeds: HashMap<String, SymbolFeed>,
    fan_in_tx: mpsc::Sender<String>,
}

/// Outcome of a `subscribe` request: which symbols were valid at all, and
/// which of those were newly added (as opposed to already subscribed).
struct SubscribeOutcome {
    valid: Vec<String>,
    newly_added: Vec<String>,
}

impl Session {
    async fn subscribe(&mut self, symbols: Vec<String>) -> SubscribeOutcome {
        let mut valid = Vec::new();
        let mut newly_added = Vec::new();
        for symbol in symbols {
            if !is_canonical_symbol(&symbol) {
                continue;
            }
            valid.push(symbol.clone());
            if self.feeds.contains_key(&symbol) {
                continue;
            }
            let channel = format!("price_updates:{symbol}");
            match self.broker.subscribe(&channel).await {
                Ok(mut sub) => {
                    let tx = self.fan_in_tx.clone();
                    let symbol_owned = symbol.clone();
                    let forward = tokio::spawn(async move {
                        while let Some(payload) = sub.receiver.recv().await {
                            let rendered = match serde_json::from_str::<PriceUpdateData>(&payload)
                            {
                                Ok(data) => ServerMessage::PriceUpdate { data }.to_json(),
                                Err(e) => {
                                    warn!(symbol = %symbol_owned, error = %e, "dropping malformed price update payload");
                                    continue;
                                }
                            };
                            if tx.send(rendered).await.is_err() {
                                break;
                            }
                        }
                    });
                    self.feeds.insert(
                        symbol.clone(),
                        SymbolFeed {
                            _sub: sub,
                            _forward: forward,
                        },
                    );
                    newly_added.push(symbol);
                }
                Err(e) => {
                    warn!(connection_id = %self.connection_id, symbol = %symbol, error = %e, "broker subscribe failed");
                }
            }
        }
        SubscribeOutcome { valid, newly_added }
    }

    fn unsubscribe(&mut self, symbols: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        for symbol in symbols {
            if self.feeds.remove(symbol).is_some() {
                removed.push(symbol.clone());
            }
        }
        removed
    }
}

pub async fn run_session(
    mut socket: WebSocket,
    broker: Arc<dyn Broker>,
    sessions: Arc<SessionTable>,
    heartbeat_interval: Duration,
    identity_key: String,
) {
    let guard = match sessions.register(identity_key) {
        Some(guard) => guard,
        None => {
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1008,
                    reason: "connection cap exceeded".into(),
                })))
                .await;
            return;
        }
    };

    let connection_id = guard.connection_id;
    info!(%connection_id, "subscription session opened");

    let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<String>(1024);
    let mut session = Session {
        connection_id,
        broker,
        feeds: HashMap::new(),
        fan_in_tx,
    };

    let mut heartbeat = interval(heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let pong = ServerMessage::Pong { timestamp: chrono::Utc::now().timestamp_millis() };
                if socket.send(Message::Text(pong.to_json())).await.is_err() {
                    break;
                }
            }
            Some(rendered) = fan_in_rx.recv() => {
                if socket.send(Message::Text(rendered)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&mut session, &text).await;
                        if let Some(reply) = reply {
                            if socket.send(Message::Text(reply.to_json())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    info!(%connection_id, "subscription session closed");
    drop(guard);
}

async fn handle_client_message(session: &mut Session, raw: &str) -> Option<ServerMessage> {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(raw);
    match parsed {
        Ok(ClientMessage::Subscribe { symbols }) => {
            let outcome = session.subscribe(symbols).await;
            if outcome.valid.is_empty() {
                Some(ServerMessage::Error {
                    message: "No valid symbols".to_string(),
                })
            } else {
                Some(ServerMessage::Subscribed {
                    symbols: outcome.newly_added,
                })
            }
        }
        Ok(ClientMessage::Unsubscribe { symbols }) => {
            let removed = session.unsubscribe(&symbols);
            Some(ServerMessage::Unsubscribed { symbols: removed })
        }
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }),
        Err(_) => Some(ServerMessage::Error {
            message: "Unknown message type".to_string(),
        }),
    }
}
