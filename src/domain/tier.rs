//! Rate limit tiers.
//!
//! A tier is a named `(capacity, refill interval)` pair. Callers are sorted into
//! tiers by who they are (authenticated user, anonymous address) and by what
//! they are doing (sensitive endpoints such as login get their own, tighter
//! tier).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named admission tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Requests carrying an authenticated user id.
    Authenticated,
    /// Requests identified only by client address.
    Anonymous,
    /// Login and registration endpoints, keyed by client address.
    Sensitive,
}

impl Tier {
    /// Stable name used in logs and bucket keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Authenticated => "authenticated",
            Tier::Anonymous => "anonymous",
            Tier::Sensitive => "sensitive",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when tier limits are invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Capacity must be at least one token.
    #[error("tier {0} must have a capacity greater than 0")]
    ZeroCapacity(Tier),
    /// Refill interval must be non-zero.
    #[error("tier {0} must have a refill interval greater than 0")]
    ZeroRefillInterval(Tier),
}

/// Capacity and refill interval of one tier.
///
/// A bucket holds at most `capacity` tokens and regains the full capacity over
/// `refill_interval_ms`, proportionally to elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum number of tokens (burst size).
    pub capacity: u32,
    /// Time in milliseconds to refill an empty bucket.
    pub refill_interval_ms: u64,
}

impl TierLimits {
    /// Create limits from a capacity and a refill interval.
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval_ms: refill_interval.as_millis().try_into().unwrap_or(u64::MAX),
        }
    }

    /// Refill interval as a `Duration`.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    /// Tokens regained per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.capacity) / self.refill_interval().as_secs_f64()
    }

    fn validate(&self, tier: Tier) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity(tier));
        }
        if self.refill_interval_ms == 0 {
            return Err(ConfigError::ZeroRefillInterval(tier));
        }
        Ok(())
    }
}

/// Limits for every tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub authenticated: TierLimits,
    pub anonymous: TierLimits,
    pub sensitive: TierLimits,
}

impl Default for RateLimitConfig {
    /// 100 requests per minute for users, 20 for anonymous traffic and 5 for
    /// login/registration attempts.
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            authenticated: TierLimits::new(100, minute),
            anonymous: TierLimits::new(20, minute),
            sensitive: TierLimits::new(5, minute),
        }
    }
}

impl RateLimitConfig {
    /// Limits configured for `tier`.
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Authenticated => &self.authenticated,
            Tier::Anonymous => &self.anonymous,
            Tier::Sensitive => &self.sensitive,
        }
    }

    /// Replace the limits of one tier.
    pub fn with_tier(mut self, tier: Tier, limits: TierLimits) -> Self {
        match tier {
            Tier::Authenticated => self.authenticated = limits,
            Tier::Anonymous => self.anonymous = limits,
            Tier::Sensitive => self.sensitive = limits,
        }
        self
    }

    /// Check every tier.
    ///
    /// # Errors
    /// Returns the first tier with a zero capacity or zero interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in [Tier::Authenticated, Tier::Anonymous, Tier::Sensitive] {
            self.limits(tier).validate(tier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limits(Tier::Authenticated).capacity, 100);
        assert_eq!(config.limits(Tier::Anonymous).capacity, 20);
        assert_eq!(config.limits(Tier::Sensitive).capacity, 5);

        for tier in [Tier::Authenticated, Tier::Anonymous, Tier::Sensitive] {
            assert_eq!(config.limits(tier).refill_interval_ms, 60_000);
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refill_rate() {
        let limits = TierLimits::new(5, Duration::from_secs(60));
        assert!((limits.refill_rate() - 5.0 / 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = RateLimitConfig::default()
            .with_tier(Tier::Anonymous, TierLimits::new(0, Duration::from_secs(1)));
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCapacity(Tier::Anonymous))
        );

        let config = RateLimitConfig::default()
            .with_tier(Tier::Sensitive, TierLimits::new(5, Duration::ZERO));
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroRefillInterval(Tier::Sensitive))
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{ "sensitive": { "capacity": 3, "refill_interval_ms": 30000 } }"#,
        )
        .unwrap();

        assert_eq!(config.sensitive, TierLimits::new(3, Duration::from_secs(30)));
        assert_eq!(config.authenticated.capacity, 100);
    }
}
