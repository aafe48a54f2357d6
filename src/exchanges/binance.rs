use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use super::{ExchangeAdapter, SubscribeRequest, SymbolAliases, WireFrame};
use crate::model::PriceObservation;

/// Quote assets Binance symbols can end in, longest first so e.g. `USDT` is
/// tried before `USD`.
const KNOWN_QUOTES: &[&str] = &["USDT", "BUSD", "USDC", "BTC", "ETH", "USD", "EUR", "GBP"];

/// Binance combined-stream API. Subscription is embedded in the URL.
pub struct BinanceAdapter {
    aliases: SymbolAliases,
}

impl BinanceAdapter {
    pub fn new(aliases: SymbolAliases) -> Self {
        Self { aliases }
    }

    fn to_stream_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_lowercase()
    }

    fn split_native(native: &str) -> Option<(&str, &str)> {
        let upper_len = native.len();
        for quote in KNOWN_QUOTES {
            if upper_len > quote.len() && native.ends_with(quote) {
                return Some((&native[..upper_len - quote.len()], quote));
            }
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct BinanceEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: BinanceTicker,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close_price: String,
    #[serde(rename = "v", default)]
    volume: Option<String>,
    #[serde(rename = "E")]
    event_time_ms: i64,
}

impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn upstream_url(&self, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@ticker", Self::to_stream_symbol(s)))
            .collect();
        format!(
            "wss://stream.binance.com:9443/stream?streams={}",
            streams.join("/")
        )
    }

    fn subscribe_request(&self, _symbols: &[String]) -> SubscribeRequest {
        SubscribeRequest::UrlEncoded
    }

    fn normalize_symbol(&self, raw: &str) -> String {
        let upper = raw.to_uppercase();
        match Self::split_native(&upper) {
            Some((base, quote)) => {
                format!("{}/{}", self.aliases.resolve(base), self.aliases.resolve(quote))
            }
            None => upper,
        }
    }

    fn parse(&self, frame: WireFrame<'_>, worker_id: &str) -> Option<PriceObservation> {
        let text = match frame {
            WireFrame::Text(t) => t,
            WireFrame::Binary(_) => return None,
        };
        let envelope: BinanceEnvelope = serde_json::from_str(text).ok()?;
        let price = Decimal::from_str(&envelope.data.close_price).ok()?;
        let volume = envelope
            .data
            .volume
            .as_deref()
            .and_then(|v| Decimal::from_str(v).ok());
        let timestamp: DateTime<Utc> = Utc
            .timestamp_millis_opt(envelope.data.event_time_ms)
            .single()
            .unwrap_or_else(Utc::now);

        Some(PriceObservation {
            id: None,
            symbol: self.normalize_symbol(&envelope.data.symbol),
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

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(SymbolAliases::default())
    }

    #[test]
    fn parses_combined_stream_ticker() {
        let frame = r#"{"stream":"btcusdt@ticker","data":{"s":"BTCUSDT","c":"67234.56","v":"1234.5","E":1700000000000}}"#;
        let obs = adapter().parse(WireFrame::Text(frame), "w-1").unwrap();
        assert_eq!(obs.symbol, "BTC/USDT");
        assert_eq!(obs.price.to_string(), "67234.56");
    }

    #[test]
    fn url_encodes_subscription() {
        let req = adapter().subscribe_request(&["BTC/USDT".to_string()]);
        assert!(matches!(req, SubscribeRequest::UrlEncoded));
        let url = adapter().upstream_url(&["BTC/USDT".to_string()]);
        assert!(url.contains("btcusdt@ticker"));
    }

    #[test]
    fn is_total_over_garbage_frames() {
        assert!(adapter().parse(WireFrame::Text("{}"), "w-1").is_none());
        assert!(adapter()
            .parse(WireFrame::Text("not json at all"), "w-1")
            .is_none());
    }

    #[test]
    fn splits_known_quote_assets() {
        assert_eq!(adapter().normalize_symbol("ETHUSDT"), "ETH/USDT");
        assert_eq!(adapter().normalize_symbol("ETHBTC"), "ETH/BTC");
    }
}
