//! Upstream connection state machine and reconnect/backoff policy.
//!
//! Grounded in `botfed-crypto-feeds`'s `exchanges/connection.rs`
//! (`calculate_backoff`, `listen_with_reconnect`), generalized to drive any
//! [`crate::exchanges::ExchangeAdapter`] rather than one crate-specific
//! trait.

use std::time::Duration;

use rand::Rng;

/// `disconnected -> connecting -> open -> reading <-> reconnecting -> failed`.
/// `Failed` is terminal; the collector must be externally restarted once
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reading,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_fraction: 0.2,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff with the configured base/cap, jittered by
    /// `±jitter_fraction`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX));
        let capped = exp.min(self.cap);
        jitter(capped, self.jitter_fraction)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    let base_ms = base.as_millis() as f64;
    let delta = base_ms * fraction;
    let mut rng = rand::thread_rng();
    let offset = rng.gen_range(-delta..=delta);
    let jittered = (base_ms + offset).max(0.0);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_fraction: 0.0,
            max_attempts: 10,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(30),
            jitter_fraction: 0.2,
            max_attempts: 10,
        };
        for attempt in 0..5 {
            let d = policy.backoff_for_attempt(attempt);
            assert!(d.as_millis() <= 30_000 + 6_000);
        }
    }

    #[test]
    fn attempts_exhaust_at_configured_max() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.exhausted(0));
        assert!(policy.exhausted(policy.max_attempts));
    }
}
