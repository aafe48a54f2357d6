//! Wire messages for the `/stream` WebSocket.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::Metadata;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { symbols: Vec<String> },
    Unsubscribed { symbols: Vec<String> },
    Pong { timestamp: i64 },
    Error { message: String },
    PriceUpdate { data: PriceUpdateData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdateData {
    pub symbol: String,
    pub price: Decimal,
    pub volume: Option<Decimal>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_parses_from_json() {
        let raw = r#"{"type":"subscribe","symbols":["BTC/USD","ETH/USD"]}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Subscribe { symbols } => {
                assert_eq!(symbols, vec!["BTC/USD".to_string(), "ETH/USD".to_string()])
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_message_has_no_body() {
        let raw = r#"{"type":"ping"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"frobnicate"}"#;
        let result: Result<ClientMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn server_message_serializes_tagged() {
        let msg = ServerMessage::Subscribed {
            symbols: vec!["BTC/USD".to_string()],
        };
        let json = msg.to_json();
        assert!(json.contains(r#""type":"subscribed""#));
    }
}
