//! Auth + rate limiter: a static, out-of-band-provisioned API key table
//! with tiered access and a broker-backed fixed-window rate limiter.

mod identity;
mod rate_limit;

pub use identity::{extract_credential, ApiIdentity, IdentityTable, Tier};
pub use rate_limit::{RateLimitDecision, RateLimiter};

use crate::context::AppError;

/// Resolves a bearer credential to its configured identity, or
/// `UNAUTHORIZED` if it's missing or unrecognized.
pub fn authenticate(table: &IdentityTable, credential: Option<&str>) -> Result<ApiIdentity, AppError> {
    let key = credential.ok_or(AppError::Unauthorized)?;
    table
        .lookup(key)
        .cloned()
        .ok_or(AppError::Unauthorized)
}

/// `require_tier(identity, allowed_tiers) -> ok | error{FORBIDDEN}`.
pub fn require_tier(identity: &ApiIdentity, allowed: &[Tier]) -> Result<(), AppError> {
    if allowed.contains(&identity.tier) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;

    fn table() -> IdentityTable {
        let config = crate::config::Config {
            identities: vec![IdentityConfig {
                key: "pub-key".to_string(),
                tier: Tier::Public,
                rate_limit: 1000,
            }],
            ..blank_config()
        };
        IdentityTable::from_config(&config)
    }

    fn blank_config() -> crate::config::Config {
        crate::config::Config {
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
    fn unknown_key_is_unauthorized() {
        let t = table();
        assert!(matches!(
            authenticate(&t, Some("nope")),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn missing_credential_is_unauthorized() {
        let t = table();
        assert!(matches!(authenticate(&t, None), Err(AppError::Unauthorized)));
    }

    #[test]
    fn wrong_tier_is_forbidden() {
        let t = table();
        let identity = authenticate(&t, Some("pub-key")).unwrap();
        assert!(matches!(
            require_tier(&identity, &[Tier::Internal, Tier::Admin]),
            Err(AppError::Forbidden)
        ));
    }

    #[test]
    fn matching_tier_is_ok() {
        let t = table();
        let identity = authenticate(&t, Some("pub-key")).unwrap();
        assert!(require_tier(&identity, &[Tier::Public, Tier::Admin]).is_ok());
    }
}
