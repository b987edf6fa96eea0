//! Token bucket arithmetic.
//!
//! A bucket starts full, loses one token per admitted request and regains
//! tokens in proportion to the time elapsed since the last refill, never
//! exceeding the tier capacity.

use crate::domain::tier::TierLimits;
use std::time::{Duration, Instant};

/// Outcome of trying to take a token from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDecision {
    /// A token was consumed; `remaining` whole tokens are left.
    Allow { remaining: u32 },
    /// The bucket is empty.
    Reject,
}

impl BucketDecision {
    /// Check if this decision is Allow.
    pub fn is_allow(&self) -> bool {
        matches!(self, BucketDecision::Allow { .. })
    }

    /// Check if this decision is Reject.
    pub fn is_reject(&self) -> bool {
        matches!(self, BucketDecision::Reject)
    }

    /// Whole tokens left after the decision (zero on rejection).
    pub fn remaining(&self) -> u32 {
        match self {
            BucketDecision::Allow { remaining } => *remaining,
            BucketDecision::Reject => 0,
        }
    }
}

/// Per-(identity, tier) token bucket.
///
/// # Example
/// ```
/// use invoice_guard::{TierLimits, TokenBucket};
/// use std::time::{Duration, Instant};
///
/// let limits = TierLimits::new(2, Duration::from_secs(60));
/// let now = Instant::now();
/// let mut bucket = TokenBucket::full(&limits, now);
///
/// assert!(bucket.try_consume(&limits, now).is_allow());
/// assert!(bucket.try_consume(&limits, now).is_allow());
/// assert!(bucket.try_consume(&limits, now).is_reject());
///
/// // Half the interval restores half the capacity.
/// let later = now + Duration::from_secs(30);
/// assert!(bucket.try_consume(&limits, later).is_allow());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket seeded at full capacity.
    pub fn full(limits: &TierLimits, now: Instant) -> Self {
        Self {
            tokens: f64::from(limits.capacity),
            last_refill: now,
        }
    }

    /// Refill for elapsed time, then try to take one token.
    pub fn try_consume(&mut self, limits: &TierLimits, now: Instant) -> BucketDecision {
        self.refill(limits, now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            BucketDecision::Allow {
                remaining: self.tokens.floor() as u32,
            }
        } else {
            BucketDecision::Reject
        }
    }

    /// Tokens currently held, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// When tokens were last added.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Whether a refill at `now` would bring the bucket back to capacity.
    ///
    /// A replenished bucket is indistinguishable from a fresh one, so it can be
    /// dropped without changing any future decision.
    pub fn is_replenished(&self, limits: &TierLimits, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        elapsed >= limits.refill_interval()
            || self.tokens + Self::regained(limits, elapsed) >= f64::from(limits.capacity)
    }

    fn refill(&mut self, limits: &TierLimits, now: Instant) {
        // Clock readings that go backwards add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let capacity = f64::from(limits.capacity);
        self.tokens = (self.tokens + Self::regained(limits, elapsed)).min(capacity);
        self.last_refill = now;
    }

    fn regained(limits: &TierLimits, elapsed: Duration) -> f64 {
        elapsed.as_secs_f64() * f64::from(limits.capacity) / limits.refill_interval().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn five_per_minute() -> TierLimits {
        TierLimits::new(5, Duration::from_secs(60))
    }

    #[test]
    fn test_exhausts_after_capacity() {
        let limits = five_per_minute();
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limits, now);

        for expected in (0..5).rev() {
            assert_eq!(
                bucket.try_consume(&limits, now),
                BucketDecision::Allow {
                    remaining: expected
                }
            );
        }
        assert_eq!(bucket.try_consume(&limits, now), BucketDecision::Reject);
        assert_eq!(bucket.try_consume(&limits, now).remaining(), 0);
    }

    #[test]
    fn test_full_interval_restores_capacity() {
        let limits = five_per_minute();
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limits, now);

        for _ in 0..5 {
            bucket.try_consume(&limits, now);
        }
        assert!(bucket.try_consume(&limits, now).is_reject());

        let later = now + Duration::from_secs(60);
        assert_eq!(
            bucket.try_consume(&limits, later),
            BucketDecision::Allow { remaining: 4 }
        );
    }

    #[test]
    fn test_partial_refill_is_proportional() {
        let limits = five_per_minute();
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limits, now);

        for _ in 0..5 {
            bucket.try_consume(&limits, now);
        }

        // 12s is exactly one token at 5 tokens/minute.
        let later = now + Duration::from_secs(12);
        assert!(bucket.try_consume(&limits, later).is_allow());
        assert!(bucket.try_consume(&limits, later).is_reject());
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limits = five_per_minute();
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limits, now);

        bucket.try_consume(&limits, now);
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(
            bucket.try_consume(&limits, much_later),
            BucketDecision::Allow { remaining: 4 }
        );
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let limits = five_per_minute();
        let now = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::full(&limits, now);

        for _ in 0..5 {
            bucket.try_consume(&limits, now);
        }
        assert!(bucket
            .try_consume(&limits, now - Duration::from_secs(10))
            .is_reject());
    }

    #[test]
    fn test_is_replenished() {
        let limits = five_per_minute();
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limits, now);
        assert!(bucket.is_replenished(&limits, now));

        bucket.try_consume(&limits, now);
        assert!(!bucket.is_replenished(&limits, now));
        assert!(bucket.is_replenished(&limits, now + Duration::from_secs(12)));
        assert!(bucket.is_replenished(&limits, now + Duration::from_secs(60)));
    }

    proptest! {
        #[test]
        fn tokens_never_exceed_capacity(
            capacity in 1u32..200,
            steps in proptest::collection::vec(0u64..120_000, 1..50),
        ) {
            let limits = TierLimits::new(capacity, Duration::from_secs(60));
            let start = Instant::now();
            let mut bucket = TokenBucket::full(&limits, start);
            let mut now = start;

            for step in steps {
                now += Duration::from_millis(step);
                let decision = bucket.try_consume(&limits, now);
                prop_assert!(bucket.tokens() <= f64::from(capacity));
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(decision.remaining() < capacity);
            }
        }
    }
}
