use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use super::{ExchangeAdapter, SubscribeRequest, SymbolAliases, WireFrame};
use crate::model::PriceObservation;

/// Kraken's public WebSocket. Subscription is a frame sent after connect;
/// the URL is fixed regardless of requested pairs.
pub struct KrakenAdapter {
    aliases: SymbolAliases,
}

impl KrakenAdapter {
    pub fn new(aliases: SymbolAliases) -> Self {
        Self { aliases }
    }

    fn to_native_pair(symbol: &str) -> String {
        // Kraken spells bitcoin `XBT`; canonical `BTC/USD` -> native `XBT/USD`.
        symbol.replacen("BTC", "XBT", 1)
    }
}

impl ExchangeAdapter for KrakenAdapter {
    fn name(&self) -> &'static str {
        "kraken"
    }

    fn upstream_url(&self, _symbols: &[String]) -> String {
        "wss://ws.kraken.com".to_string()
    }

    fn subscribe_request(&self, symbols: &[String]) -> SubscribeRequest {
        let pairs: Vec<String> = symbols.iter().map(|s| Self::to_native_pair(s)).collect();
        let msg = serde_json::json!({
            "event": "subscribe",
            "pair": pairs,
            "subscription": { "name": "ticker" },
        });
        SubscribeRequest::FirstFrame(msg.to_string())
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        match raw.split_once('/') {
            Some((base, quote)) => {
                format!("{}/{}", self.aliases.resolve(base), self.aliases.resolve(quote))
            }
            None => raw.to_uppercase(),
        }
    }

    fn parse(&self, frame: WireFrame<'_>, worker_id: &str) -> Option<PriceObservation> {
        let text = match frame {
            WireFrame::Text(t) => t,
            WireFrame::Binary(_) => return None,
        };

        // Event frames (subscription acks, heartbeats) are JSON objects;
        // data frames are top-level arrays. Only arrays carry ticker data.
        let value: Value = serde_json::from_str(text).ok()?;
        let array = value.as_array()?;
        if array.len() < 4 {
            return None;
        }
        if array.get(2).and_then(|v| v.as_str()) != Some("ticker") {
            return None;
        }
        let native_pair = array.get(3).and_then(|v| v.as_str())?;
        let payload = array.get(1)?;

        // "c" = [last trade price, lot volume]
        let close = payload.get("c").and_then(|v| v.as_array())?;
        let price = close.first().and_then(|v| v.as_str())?;
        let price = Decimal::from_str(price).ok()?;
        let volume = close
            .get(1)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok());

        Some(PriceObservation {
            id: None,
            symbol: self.normalize_symbol(native_pair),
            price,
            volume,
            source: self.name().to_string(),
            timestamp: Utc::now(),
            worker_id: worker_id.to_string(),
            metadata: Default::default(),
            ingested_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> KrakenAdapter {
        KrakenAdapter::new(SymbolAliases::with_overrides(Default::default()))
    }

    #[test]
    fn parses_ticker_array_frame() {
        let frame = r#"[340,{"c":["67234.56000","0.1"]},"ticker","XBT/USD"]"#;
        let obs = adapter().parse(WireFrame::Text(frame), "w-1").unwrap();
        assert_eq!(obs.symbol, "BTC/USD");
        assert_eq!(obs.price.to_string(), "67234.56000");
    }

    #[test]
    fn ignores_event_frames() {
        let frame = r#"{"event":"heartbeat"}"#;
        assert!(adapter().parse(WireFrame::Text(frame), "w-1").is_none());
    }

    #[test]
    fn ignores_non_ticker_arrays() {
        let frame = r#"[340,{"a":["1"]},"spread","XBT/USD"]"#;
        assert!(adapter().parse(WireFrame::Text(frame), "w-1").is_none());
    }

    #[test]
    fn xbt_aliases_to_btc_by_default() {
        assert_eq!(adapter().normalize_symbol("XBT/USD"), "BTC/USD");
    }
}
