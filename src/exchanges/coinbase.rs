use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;

use super::{ExchangeAdapter, SubscribeRequest, SymbolAliases, WireFrame};
use crate::model::{canonicalize_symbol, PriceObservation};

/// Coinbase Exchange (`ws-feed.exchange.coinbase.com`) ticker channel.
/// Subscription carries the product ids; the URL itself is fixed.
pub struct CoinbaseAdapter {
    aliases: SymbolAliases,
}

impl CoinbaseAdapter {
    pub fn new(aliases: SymbolAliases) -> Self {
        Self { aliases }
    }

    fn to_product_id(&self, symbol: &str) -> String {
        symbol.replace('/', "-")
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CoinbaseMessage {
    #[serde(rename = "ticker")]
    Ticker(CoinbaseTicker),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CoinbaseTicker {
    product_id: String,
    price: String,
    #[serde(default)]
    last_size: Option<String>,
    time: String,
}

impl ExchangeAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn upstream_url(&self, _symbols: &[String]) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn subscribe_request(&self, symbols: &[String]) -> SubscribeRequest {
        let product_ids: Vec<String> = symbols.iter().map(|s| self.to_product_id(s)).collect();
        let msg = json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channels": ["ticker"],
        });
        SubscribeRequest::FirstFrame(msg.to_string())
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        // Coinbase spells products `BASE-QUOTE`.
        let dashed = raw.replace('-', "/");
        let canon = canonicalize_symbol(&dashed);
        match canon.split_once('/') {
            Some((base, quote)) => format!(
                "{}/{}",
                self.aliases.resolve(base),
                self.aliases.resolve(quote)
            ),
            None => canon,
        }
    }

    fn parse(&self, frame: WireFrame<'_>, worker_id: &str) -> Option<PriceObservation> {
        let text = match frame {
            WireFrame::Text(t) => t,
            WireFrame::Binary(_) => return None,
        };
        let msg: CoinbaseMessage = serde_json::from_str(text).ok()?;
        let CoinbaseMessage::Ticker(ticker) = msg else {
            return None;
        };
        let price = Decimal::from_str(&ticker.price).ok()?;
        let volume = ticker
            .last_size
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok());
        let timestamp = ticker
            .time
            .parse()
            .unwrap_or_else(|_| Utc::now());

        Some(PriceObservation {
            id: None,
            symbol: self.normalize_symbol(&ticker.product_id),
            price,
            volume,
            source: self.name().to_string(),
            timestamp,
            worker_id: worker_id.to_string(),
            metadata: Default::default(),
            ingested_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CoinbaseAdapter {
        CoinbaseAdapter::new(SymbolAliases::default())
    }

    #[test]
    fn parses_ticker_frame() {
        let frame = r#"{"type":"ticker","product_id":"BTC-USD","price":"67234.56","last_size":"0.01","time":"2025-10-10T00:00:00.000000Z"}"#;
        let obs = adapter().parse(WireFrame::Text(frame), "w-1").unwrap();
        assert_eq!(obs.symbol, "BTC/USD");
        assert_eq!(obs.price.to_string(), "67234.56");
        assert_eq!(obs.source, "coinbase");
    }

    #[test]
    fn ignores_non_ticker_frames() {
        let frame = r#"{"type":"subscriptions","channels":[]}"#;
        assert!(adapter().parse(WireFrame::Text(frame), "w-1").is_none());
    }

    #[test]
    fn is_total_over_garbage_frames() {
        assert!(adapter().parse(WireFrame::Text("not json"), "w-1").is_none());
        assert!(adapter().parse(WireFrame::Binary(&[0, 1, 2]), "w-1").is_none());
    }

    #[test]
    fn subscribe_uses_dashed_product_ids() {
        let req = adapter().subscribe_request(&["BTC/USD".to_string()]);
        match req {
            SubscribeRequest::FirstFrame(frame) => assert!(frame.contains("BTC-USD")),
            _ => panic!("expected first-frame subscription"),
        }
    }
}
