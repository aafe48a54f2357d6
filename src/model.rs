//! Canonical price observation type and validation rules.
//!
//! Numbers are carried as `rust_decimal::Decimal` end to end so the write
//! path never loses precision to binary floating point.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

lazy_static! {
    /// `BASE/QUOTE`, both sides uppercase ASCII letters, length >= 2.
    static ref SYMBOL_RE: Regex = Regex::new(r"^[A-Z]{2,}/[A-Z]{2,}$").unwrap();
}

/// Free-form, core-opaque metadata attached to an observation.
pub type Metadata = BTreeMap<String, Value>;

/// A single parsed price record from one exchange at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceObservation {
    /// Server-assigned unique identifier. Absent on the wire, assigned at insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub symbol: String,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Assigned by the ingestion endpoint. Never trusted from the client;
    /// absent on inbound wire payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
}

/// Validation failure, reported back as part of a `VALIDATION_ERROR`.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Maximum allowed drift between a client-supplied timestamp and the server
/// clock, in either direction, before the observation is rejected.
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::hours(24);

/// Trims whitespace and upper-cases the two symbol halves; normalizes the
/// `source` identifier to lowercase. Does not validate.
pub fn canonicalize(mut obs: PriceObservation) -> PriceObservation {
    obs.symbol = canonicalize_symbol(&obs.symbol);
    obs.source = obs.source.trim().to_lowercase();
    obs.worker_id = obs.worker_id.trim().to_string();
    obs
}

pub fn canonicalize_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once('/') {
        Some((base, quote)) => format!(
            "{}/{}",
            base.trim().to_uppercase(),
            quote.trim().to_uppercase()
        ),
        None => trimmed.to_uppercase(),
    }
}

pub fn is_canonical_symbol(symbol: &str) -> bool {
    SYMBOL_RE.is_match(symbol)
}

/// Validates an observation against its field invariants. Does not
/// check `ingested_at` against the 24h clock-skew window — that is an
/// ingestion-endpoint concern since it depends on the server clock at the
/// time of the request, not a property of the record alone.
pub fn validate(obs: &PriceObservation) -> Result<(), ValidationError> {
    if !is_canonical_symbol(&obs.symbol) {
        return Err(ValidationError::new(
            "symbol",
            "must match ^[A-Z]+/[A-Z]+$",
        ));
    }
    if obs.price.is_sign_negative() {
        return Err(ValidationError::new("price", "must be non-negative"));
    }
    if let Some(volume) = obs.volume {
        if volume.is_sign_negative() {
            return Err(ValidationError::new("volume", "must be non-negative"));
        }
    }
    if obs.source.trim().is_empty() {
        return Err(ValidationError::new("source", "must not be empty"));
    }
    if obs.worker_id.trim().is_empty() {
        return Err(ValidationError::new("worker_id", "must not be empty"));
    }
    Ok(())
}

/// Checks the `timestamp <= ingested_at + tolerance` half of the clock-skew
/// invariant (the ingestion endpoint also rejects timestamps too far in the
/// future relative to "now", covered separately in `ingest`).
pub fn within_clock_skew(timestamp: DateTime<Utc>, ingested_at: DateTime<Utc>) -> bool {
    timestamp <= ingested_at + CLOCK_SKEW_TOLERANCE
        && ingested_at <= timestamp + CLOCK_SKEW_TOLERANCE
}

pub fn new_observation_id() -> Uuid {
    Uuid::new_v4()
}
