//! Per-exchange parse and subscribe protocol adapters.
//!
//! An adapter is a pure function set: given raw bytes off the wire it
//! produces a normalized [`PriceObservation`] or `None`. It never touches a
//! socket itself; [`crate::collector`] owns the connection and hands frames
//! to whichever adapter it was built with.

mod binance;
mod coinbase;
mod kraken;

pub use binance::BinanceAdapter;
pub use coinbase::CoinbaseAdapter;
pub use kraken::KrakenAdapter;

use std::collections::HashMap;

use crate::model::PriceObservation;

/// How a collector should ask an upstream to start streaming `symbols`.
pub enum SubscribeRequest {
    /// The URL alone selects the stream; no frame needs to be sent.
    UrlEncoded,
    /// Send this text frame immediately after the handshake completes, and
    /// before any frame is treated as data.
    FirstFrame(String),
}

/// A frame arriving off an exchange's WebSocket.
pub enum WireFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Resolves one exchange's native symbol spelling to/from the canonical
/// `BASE/QUOTE` form, honoring operator-configured aliases (e.g. Kraken's
/// `XBT` -> `BTC`, or an explicit `USDT` -> `USD` quote mapping).
#[derive(Debug, Clone, Default)]
pub struct SymbolAliases {
    /// native (uppercased) -> canonical
    table: HashMap<String, String>,
}

impl SymbolAliases {
    pub fn new(table: HashMap<String, String>) -> Self {
        let table = table
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v.to_uppercase()))
            .collect();
        Self { table }
    }

    /// Baseline cross-exchange aliases (e.g. Kraken's `XBT` spelling for
    /// `BTC`) merged with operator-configured overrides such as an explicit
    /// `USDT` -> `USD` quote mapping. Operator entries win on conflict.
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        let mut table: HashMap<String, String> =
            [("XBT".to_string(), "BTC".to_string())].into_iter().collect();
        for (k, v) in overrides {
            table.insert(k.to_uppercase(), v.to_uppercase());
        }
        Self { table }
    }

    /// Resolves a single base/quote token (e.g. `"XBT"`, `"USDT"`) to its
    /// canonical spelling, falling back to the token itself when no alias is
    /// configured.
    pub fn resolve(&self, token: &str) -> String {
        let upper = token.to_uppercase();
        self.table.get(&upper).cloned().unwrap_or(upper)
    }
}

/// Capability set each exchange adapter implements.
pub trait ExchangeAdapter: Send + Sync {
    /// Short lowercase identifier used as `PriceObservation::source`.
    fn name(&self) -> &'static str;

    /// Builds the upstream connection URL for the given canonical symbols.
    fn upstream_url(&self, symbols: &[String]) -> String;

    /// Returns how to subscribe once connected.
    fn subscribe_request(&self, symbols: &[String]) -> SubscribeRequest;

    /// Resolves an exchange-native symbol spelling to the canonical form.
    /// MUST be deterministic and total: an adapter must always produce
    /// *some* canonical string, even if downstream validation later rejects
    /// it as malformed.
    fn normalize_symbol(&self, raw: &str) -> String;

    /// Parses one wire frame. MUST be total over any bytes the upstream can
    /// send: unknown/uninteresting frames (heartbeats, ack frames, frames
    /// for instruments this adapter doesn't cover) yield `None`, never an
    /// error.
    fn parse(&self, frame: WireFrame<'_>, worker_id: &str) -> Option<PriceObservation>;
}

/// Registry of built-in adapters, keyed by exchange name.
pub fn builtin_adapters(aliases: &SymbolAliases) -> HashMap<&'static str, Box<dyn ExchangeAdapter>> {
    let mut m: HashMap<&'static str, Box<dyn ExchangeAdapter>> = HashMap::new();
    m.insert("coinbase", Box::new(CoinbaseAdapter::new(aliases.clone())));
    m.insert("binance", Box::new(BinanceAdapter::new(aliases.clone())));
    m.insert("kraken", Box::new(KrakenAdapter::new(aliases.clone())));
    m
}
