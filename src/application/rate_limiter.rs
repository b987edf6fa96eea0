//! Token-bucket admission control.
//!
//! The rate limiter keeps one [`TokenBucket`] per `(identity, tier)` pair in an
//! injected [`Storage`] and decides whether a request may proceed. It has no
//! dependency on the invoice store and never blocks on I/O.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage};
use crate::domain::bucket::{BucketDecision, TokenBucket};
use crate::domain::error::InvoicingError;
use crate::domain::tier::{ConfigError, RateLimitConfig, Tier};
use crate::infrastructure::storage::ShardedStorage;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub identity: String,
    pub tier: Tier,
}

impl BucketKey {
    pub fn new(identity: impl Into<String>, tier: Tier) -> Self {
        Self {
            identity: identity.into(),
            tier,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.identity)
    }
}

/// Who is making a request, as supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated user id.
    User(String),
    /// Client network address of an unauthenticated caller.
    Address(String),
}

impl Identity {
    /// Tier applied to every request from this identity.
    pub fn general_tier(&self) -> Tier {
        match self {
            Identity::User(_) => Tier::Authenticated,
            Identity::Address(_) => Tier::Anonymous,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Identity::User(key) | Identity::Address(key) => key,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::Address(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Whole tokens left after the check; 0 on rejection.
    pub remaining: u32,
    /// Capacity of the tier that was checked.
    pub limit: u32,
    /// Always `now + refill interval` of the tier.
    pub reset_at: Instant,
    /// Time until the bucket holds a whole token again; zero when allowed.
    pub retry_after: Duration,
    pub tier: Tier,
    reset_after: Duration,
}

impl RateLimitResult {
    /// HTTP response headers describing this decision.
    ///
    /// `X-RateLimit-Reset` carries the seconds until `reset_at`. `Retry-After`
    /// is only present on rejection.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", ceil_secs(self.reset_after).to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", ceil_secs(self.retry_after).max(1).to_string()));
        }
        headers
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Coordinates rate limiting decisions.
///
/// Generic over the bucket storage; in production use the default
/// `Arc<ShardedStorage>`, which can be shared by several limiters.
#[derive(Clone)]
pub struct RateLimiter<S = Arc<ShardedStorage<BucketKey, TokenBucket>>>
where
    S: Storage<BucketKey, TokenBucket>,
{
    storage: S,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    metrics: Metrics,
}

impl<S> fmt::Debug for RateLimiter<S>
where
    S: Storage<BucketKey, TokenBucket>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("buckets", &self.storage.len())
            .finish_non_exhaustive()
    }
}

impl<S> RateLimiter<S>
where
    S: Storage<BucketKey, TokenBucket>,
{
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `storage` - Bucket storage
    /// * `clock` - Time source for refill arithmetic
    /// * `config` - Limits per tier
    /// * `metrics` - Metrics tracker
    ///
    /// # Errors
    /// Returns `ConfigError` if any tier has a zero capacity or a zero refill
    /// interval.
    pub fn new(
        storage: S,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        metrics: Metrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            storage,
            clock,
            config,
            metrics,
        })
    }

    /// Refill the bucket for `(key, tier)` and try to take one token.
    ///
    /// A bucket seen for the first time starts full. Checks for the same pair
    /// are serialized by the storage; distinct pairs never affect each other.
    pub fn check_and_consume(&self, key: &str, tier: Tier) -> RateLimitResult {
        let limits = *self.config.limits(tier);
        let now = self.clock.now();
        let reset_after = limits.refill_interval();

        let (decision, tokens) = self.storage.with_entry_mut(
            BucketKey::new(key, tier),
            || TokenBucket::full(&limits, now),
            |bucket| {
                let decision = bucket.try_consume(&limits, now);
                (decision, bucket.tokens())
            },
        );

        let retry_after = match decision {
            BucketDecision::Allow { .. } => Duration::ZERO,
            BucketDecision::Reject => {
                let missing = (1.0 - tokens).max(0.0);
                Duration::from_secs_f64(
                    missing * limits.refill_interval().as_secs_f64() / f64::from(limits.capacity),
                )
            }
        };

        match decision {
            BucketDecision::Allow { remaining } => {
                self.metrics.record_allowed();
                tracing::debug!(tier = %tier, identity = key, remaining, "request admitted");
            }
            BucketDecision::Reject => {
                self.metrics.record_rejected();
                tracing::debug!(tier = %tier, identity = key, "request rejected");
            }
        }

        RateLimitResult {
            allowed: decision.is_allow(),
            remaining: decision.remaining(),
            limit: limits.capacity,
            reset_at: now + reset_after,
            retry_after,
            tier,
            reset_after,
        }
    }

    /// Gate one request from `identity`.
    ///
    /// Every request is checked against the identity's general tier. Requests
    /// from anonymous callers to login or registration endpoints
    /// (`sensitive`) are additionally checked against the sensitive tier,
    /// keyed by address. The returned result is the last check performed.
    ///
    /// # Errors
    /// `RateLimitExceeded` naming the tier that rejected the request.
    pub fn admit(
        &self,
        identity: &Identity,
        sensitive: bool,
    ) -> Result<RateLimitResult, InvoicingError> {
        let general = self.check_and_consume(identity.key(), identity.general_tier());
        if !general.allowed {
            return Err(self.rejection(identity, &general));
        }

        match identity {
            Identity::Address(address) if sensitive => {
                let strict = self.check_and_consume(address, Tier::Sensitive);
                if strict.allowed {
                    Ok(strict)
                } else {
                    Err(self.rejection(identity, &strict))
                }
            }
            _ => Ok(general),
        }
    }

    fn rejection(&self, identity: &Identity, result: &RateLimitResult) -> InvoicingError {
        tracing::warn!(
            identity = %identity,
            tier = %result.tier,
            retry_after_ms = result.retry_after.as_millis() as u64,
            "rate limit exceeded"
        );
        InvoicingError::RateLimitExceeded {
            tier: result.tier,
            retry_after: result.retry_after,
        }
    }

    /// Drop buckets that would be back at full capacity by now.
    ///
    /// Such a bucket behaves exactly like a freshly created one, so eviction
    /// never changes an admission decision. Returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let config = self.config;
        let mut evicted = 0;
        self.storage.retain(|key, bucket| {
            let keep = !bucket.is_replenished(config.limits(key.tier), now);
            if !keep {
                evicted += 1;
            }
            keep
        });

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
            tracing::debug!(evicted, remaining = self.storage.len(), "evicted idle buckets");
        }
        evicted
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.storage.len()
    }

    /// Forget every bucket.
    pub fn clear(&self) {
        self.storage.clear();
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
