use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use invoice_guard::infrastructure::mocks::MockClock;
use invoice_guard::{
    Identity, InvoicingError, Metrics, RateLimitConfig, RateLimiter, ShardedStorage, SystemClock,
    Tier, TierLimits,
};

fn limiter_with(clock: &MockClock, config: RateLimitConfig) -> RateLimiter {
    RateLimiter::new(
        Arc::new(ShardedStorage::new()),
        Arc::new(clock.clone()),
        config,
        Metrics::new(),
    )
    .unwrap()
}

fn limiter(clock: &MockClock) -> RateLimiter {
    limiter_with(clock, RateLimitConfig::default())
}

#[test]
fn test_sensitive_tier_allows_five_then_rejects() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    for expected_remaining in (0..5).rev() {
        let result = limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
        assert!(result.allowed);
        assert_eq!(result.remaining, expected_remaining);
        assert_eq!(result.limit, 5);
    }

    let sixth = limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    assert!(!sixth.allowed);
    assert_eq!(sixth.remaining, 0);
    // One token is a fifth of the interval away.
    assert_eq!(sixth.retry_after, Duration::from_secs(12));
}

#[test]
fn test_bucket_refills_after_interval() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    }
    assert!(!limiter.check_and_consume("10.0.0.1", Tier::Sensitive).allowed);

    clock.advance(Duration::from_secs(60));

    let result = limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    assert!(result.allowed);
    assert_eq!(result.remaining, 4);
}

#[test]
fn test_partial_refill_is_proportional() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    }

    // 12s is worth exactly one token at 5 per minute.
    clock.advance(Duration::from_secs(12));
    assert!(limiter.check_and_consume("10.0.0.1", Tier::Sensitive).allowed);
    assert!(!limiter.check_and_consume("10.0.0.1", Tier::Sensitive).allowed);
}

#[test]
fn test_identities_and_tiers_are_independent() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    }
    assert!(!limiter.check_and_consume("10.0.0.1", Tier::Sensitive).allowed);

    // Another address has its own bucket.
    let other = limiter.check_and_consume("10.0.0.2", Tier::Sensitive);
    assert!(other.allowed);
    assert_eq!(other.remaining, 4);

    // Same address, different tier.
    let anonymous = limiter.check_and_consume("10.0.0.1", Tier::Anonymous);
    assert!(anonymous.allowed);
    assert_eq!(anonymous.remaining, 19);

    assert_eq!(limiter.bucket_count(), 3);
}

#[test]
fn test_admit_applies_sensitive_tier_to_addresses_only() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);
    let visitor = Identity::Address("203.0.113.9".into());
    let user = Identity::User("user-1".into());

    for _ in 0..5 {
        limiter.admit(&visitor, true).unwrap();
    }
    let error = limiter.admit(&visitor, true).unwrap_err();
    assert!(matches!(
        error,
        InvoicingError::RateLimitExceeded {
            tier: Tier::Sensitive,
            ..
        }
    ));

    // Non-sensitive traffic from the same address still has anonymous tokens.
    assert!(limiter.admit(&visitor, false).is_ok());

    // Authenticated callers never hit the sensitive tier.
    for _ in 0..10 {
        let result = limiter.admit(&user, true).unwrap();
        assert_eq!(result.tier, Tier::Authenticated);
    }
}

#[test]
fn test_rejection_headers() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    }
    let rejected = limiter.check_and_consume("10.0.0.1", Tier::Sensitive);

    let headers = rejected.headers();
    assert!(headers.contains(&("X-RateLimit-Limit", "5".to_string())));
    assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    assert!(headers.contains(&("X-RateLimit-Reset", "60".to_string())));
    assert!(headers.contains(&("Retry-After", "12".to_string())));
}

#[test]
fn test_metrics_count_decisions() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter_with(
        &clock,
        RateLimitConfig::default()
            .with_tier(Tier::Anonymous, TierLimits::new(2, Duration::from_secs(10))),
    );

    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.1", Tier::Anonymous);
    }

    let snapshot = limiter.metrics().snapshot();
    assert_eq!(snapshot.requests_allowed, 2);
    assert_eq!(snapshot.requests_rejected, 3);
    assert_eq!(snapshot.total_requests(), 5);
}

#[test]
fn test_concurrent_checks_never_exceed_capacity() {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(ShardedStorage::new()),
        Arc::new(SystemClock::new()),
        RateLimitConfig::default()
            .with_tier(Tier::Sensitive, TierLimits::new(50, Duration::from_secs(3600))),
        Metrics::new(),
    )
    .unwrap());
    let admitted = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    if limiter.check_and_consume("10.0.0.1", Tier::Sensitive).allowed {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // At one token per 72s, the test cannot run long enough to earn another.
    assert_eq!(admitted.load(Ordering::Relaxed), 50);
}

#[test]
fn test_evict_idle_keeps_partially_drained_buckets() {
    let clock = MockClock::new(Instant::now());
    let limiter = limiter(&clock);

    limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
    for _ in 0..5 {
        limiter.check_and_consume("10.0.0.2", Tier::Sensitive);
    }

    // 12s refills the first bucket to capacity but not the second.
    clock.advance(Duration::from_secs(12));
    assert_eq!(limiter.evict_idle(), 1);
    assert_eq!(limiter.bucket_count(), 1);

    // The survivor kept its state.
    assert!(limiter.check_and_consume("10.0.0.2", Tier::Sensitive).allowed);
    assert!(!limiter.check_and_consume("10.0.0.2", Tier::Sensitive).allowed);
}
