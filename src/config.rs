//! Process configuration.
//!
//! Env-var reads with string defaults via `unwrap_or_else`,
//! `dotenv::dotenv().ok()` loaded first, covering the full configuration
//! surface this service needs: store/broker connection info, identity
//! tables, rate limits, and WS tuning.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::Tier;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub key: String,
    pub tier: Tier,
    pub rate_limit: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,

    pub store_path: String,
    pub store_pool_size: usize,
    pub store_timeout_ms: u64,

    pub broker_url: String,
    pub broker_timeout_ms: u64,
    pub cache_latest_ttl_s: u64,

    pub identities: Vec<IdentityConfig>,

    pub rate_limit_internal: u32,
    pub rate_limit_public_free: u32,
    pub rate_limit_admin: u32,

    pub ws_heartbeat_interval_ms: u64,
    pub ws_max_connections: usize,

    pub log_level: String,

    /// Exchange-native quote/base token -> canonical spelling, e.g. an
    /// explicit `USDT` -> `USD` mapping. A deployment decision, not a core
    /// one — different operators may want different aliasing policies.
    pub symbol_aliases: HashMap<String, String>,

    /// Path to an optional TOML file of extra identities, merged on top of
    /// the `IDENTITIES_*` env lists. Lets an operator hand out keys without
    /// redeploying the process env.
    pub identities_path: Option<String>,
}

/// Shape of the optional identities file: one array of bare keys per tier.
#[derive(Debug, Deserialize, Default)]
struct IdentitiesFile {
    #[serde(default)]
    internal: Vec<String>,
    #[serde(default)]
    public: Vec<String>,
    #[serde(default)]
    admin: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:3000");

        let store_path = env_or("STORE_URL", "./pricefeed.db");
        let store_pool_size = env_parse_or("STORE_POOL_SIZE", 20usize)?;
        let store_timeout_ms = env_parse_or("STORE_TIMEOUT_MS", 5000u64)?;

        let broker_url = env_or("BROKER_URL", "redis://127.0.0.1:6379");
        let broker_timeout_ms = env_parse_or("BROKER_TIMEOUT_MS", 2000u64)?;
        let cache_latest_ttl_s = env_parse_or("CACHE_LATEST_TTL_S", 60u64)?;

        let rate_limit_internal = env_parse_or("RATE_LIMIT_INTERNAL", 5000u32)?;
        let rate_limit_public_free = env_parse_or("RATE_LIMIT_PUBLIC_FREE", 1000u32)?;
        let rate_limit_admin = env_parse_or("RATE_LIMIT_ADMIN", 0u32)?;

        let ws_heartbeat_interval_ms = env_parse_or("WS_HEARTBEAT_INTERVAL_MS", 30_000u64)?;
        let ws_max_connections = env_parse_or("WS_MAX_CONNECTIONS", 10_000usize)?;

        let log_level = env_or("LOG_LEVEL", "info");

        let mut identities = Vec::new();
        identities.extend(identity_list("IDENTITIES_INTERNAL", Tier::Internal, rate_limit_internal));
        identities.extend(identity_list("IDENTITIES_PUBLIC", Tier::Public, rate_limit_public_free));
        identities.extend(identity_list("IDENTITIES_ADMIN", Tier::Admin, rate_limit_admin));

        let symbol_aliases = parse_pairs(&env_or("SYMBOL_ALIASES", ""));
        let identities_path = std::env::var("IDENTITIES_PATH").ok();

        let mut config = Self {
            bind_addr,
            store_path,
            store_pool_size,
            store_timeout_ms,
            broker_url,
            broker_timeout_ms,
            cache_latest_ttl_s,
            identities,
            rate_limit_internal,
            rate_limit_public_free,
            rate_limit_admin,
            ws_heartbeat_interval_ms,
            ws_max_connections,
            log_level,
            symbol_aliases,
            identities_path,
        };

        if let Some(path) = config.identities_path.clone() {
            config
                .merge_identities_file(&path)
                .with_context(|| format!("loading identities file {path}"))?;
        }

        Ok(config)
    }

    /// Parses `path` as TOML and appends its `[internal]`/`[public]`/`[admin]`
    /// key arrays to the in-process identity table. Unknown keys in the file
    /// are an error; a missing file is not (the path is optional by design).
    pub fn merge_identities_file(&mut self, path: &str) -> Result<()> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(format!("reading {path}")),
        };
        let file: IdentitiesFile = toml::from_str(&raw).context("parsing identities TOML")?;

        self.identities.extend(file.internal.into_iter().map(|key| IdentityConfig {
            key,
            tier: Tier::Internal,
            rate_limit: self.rate_limit_internal,
        }));
        self.identities.extend(file.public.into_iter().map(|key| IdentityConfig {
            key,
            tier: Tier::Public,
            rate_limit: self.rate_limit_public_free,
        }));
        self.identities.extend(file.admin.into_iter().map(|key| IdentityConfig {
            key,
            tier: Tier::Admin,
            rate_limit: self.rate_limit_admin,
        }));
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }

    pub fn ws_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.ws_heartbeat_interval_ms)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}"))
            .context(format!("parsing {key}")),
        Err(_) => Ok(default),
    }
}

/// Parses a comma-separated list of API keys from `env_key` into
/// [`IdentityConfig`] entries of the given tier.
fn identity_list(env_key: &str, tier: Tier, rate_limit: u32) -> Vec<IdentityConfig> {
    std::env::var(env_key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|key| IdentityConfig {
            key: key.to_string(),
            tier,
            rate_limit,
        })
        .collect()
}

/// Parses `A=B,C=D` into a map, ignoring malformed or empty pairs.
fn parse_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_splits_on_comma_and_equals() {
        let m = parse_pairs("USDT=USD, XBT=BTC");
        assert_eq!(m.get("USDT"), Some(&"USD".to_string()));
        assert_eq!(m.get("XBT"), Some(&"BTC".to_string()));
    }

    #[test]
    fn parse_pairs_ignores_malformed_entries() {
        let m = parse_pairs("garbage,,A=B");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("A"), Some(&"B".to_string()));
    }

    fn blank_config() -> Config {
        Config {
            bind_addr: "0.0.0.0:0".to_string(),
            store_path: ":memory:".to_string(),
            store_pool_size: 1,
            store_timeout_ms: 1000,
            broker_url: "redis://127.0.0.1:6379".to_string(),
            broker_timeout_ms: 2000,
            cache_latest_ttl_s: 60,
            identities: Vec::new(),
            rate_limit_internal: 5000,
            rate_limit_public_free: 1000,
            rate_limit_admin: 0,
            ws_heartbeat_interval_ms: 30_000,
            ws_max_connections: 10_000,
            log_level: "info".to_string(),
            symbol_aliases: Default::default(),
            identities_path: None,
        }
    }

    #[test]
    fn merge_identities_file_appends_keys_by_tier() {
        let dir = std::env::temp_dir().join(format!("pricefeed-identities-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("identities.toml");
        std::fs::write(
            &path,
            r#"
            internal = ["svc-collector"]
            public = ["pk-alice", "pk-bob"]
            admin = []
            "#,
        )
        .unwrap();

        let mut config = blank_config();
        config.merge_identities_file(path.to_str().unwrap()).unwrap();

        assert_eq!(config.identities.len(), 3);
        assert!(config
            .identities
            .iter()
            .any(|id| id.key == "svc-collector" && id.tier == Tier::Internal));
        assert!(config
            .identities
            .iter()
            .any(|id| id.key == "pk-alice" && id.tier == Tier::Public));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn merge_identities_file_missing_path_is_not_an_error() {
        let mut config = blank_config();
        config
            .merge_identities_file("/nonexistent/path/identities.toml")
            .unwrap();
        assert!(config.identities.is_empty());
    }
}
