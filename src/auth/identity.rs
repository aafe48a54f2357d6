//! API identity table and tier enforcement.
//!
//! Credentials are extracted header-first, then query-fallback: try
//! `Authorization: Bearer`, then a query parameter for WebSocket clients
//! that can't set custom headers. The identity table itself is immutable,
//! out-of-band-provisioned, and populated once at process start rather
//! than backed by a login/session flow.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::Serialize;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Internal,
    Public,
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Internal => "internal",
            Tier::Public => "public",
            Tier::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiIdentity {
    pub key: String,
    pub tier: Tier,
    /// Requests/minute; `0` means unlimited.
    pub rate_limit: u32,
}

/// Read-only after boot: a plain `HashMap` built once from configuration
/// and never mutated for the lifetime of the process.
pub struct IdentityTable {
    by_key: HashMap<String, ApiIdentity>,
}

impl IdentityTable {
    pub fn from_config(config: &Config) -> Self {
        let by_key = config
            .identities
            .iter()
            .map(|i| {
                (
                    i.key.clone(),
                    ApiIdentity {
                        key: i.key.clone(),
                        tier: i.tier,
                        rate_limit: i.rate_limit,
                    },
                )
            })
            .collect();
        Self { by_key }
    }

    pub fn lookup(&self, key: &str) -> Option<&ApiIdentity> {
        self.by_key.get(key)
    }
}

/// Extracts a bearer credential from `Authorization: Bearer <key>`, falling
/// back to a `key=` query parameter for WebSocket upgrades.
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    from_header.or_else(|| {
        query.and_then(|q| {
            url_query_param(q, "key")
        })
    })
}

fn url_query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            Some(v.to_string())
        } else {
            None
        }
    })
}
