//! Persistent upstream WebSocket collector: connect/reconnect, parse,
//! batch, and submit to the ingestion endpoint.

pub mod batcher;
pub mod connection;
pub mod runtime;
pub mod sender;

pub use batcher::{Batcher, BatcherConfig};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use runtime::{Collector, CollectorConfig};
pub use sender::{HttpSender, SendOutcome};
