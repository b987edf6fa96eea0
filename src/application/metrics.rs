//! Observability metrics for the invoicing core.
//!
//! Counters for rate limiting decisions, transaction retries, version
//! conflicts and number allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics shared by every component of one service.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Cloning is cheap and clones observe the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_allowed: AtomicU64,
    requests_rejected: AtomicU64,
    buckets_evicted: AtomicU64,
    transaction_retries: AtomicU64,
    version_conflicts: AtomicU64,
    numbers_allocated: AtomicU64,
    creation_retries: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.inner.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.inner
            .buckets_evicted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_retry(&self) {
        self.inner.transaction_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_version_conflict(&self) {
        self.inner.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_number_allocated(&self) {
        self.inner.numbers_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_creation_retry(&self) {
        self.inner.creation_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests admitted by the rate limiter.
    pub fn requests_allowed(&self) -> u64 {
        self.inner.requests_allowed.load(Ordering::Relaxed)
    }

    /// Requests turned away by the rate limiter.
    pub fn requests_rejected(&self) -> u64 {
        self.inner.requests_rejected.load(Ordering::Relaxed)
    }

    /// Idle buckets dropped by eviction.
    pub fn buckets_evicted(&self) -> u64 {
        self.inner.buckets_evicted.load(Ordering::Relaxed)
    }

    /// Transaction attempts retried after a transient conflict.
    pub fn transaction_retries(&self) -> u64 {
        self.inner.transaction_retries.load(Ordering::Relaxed)
    }

    /// Updates rejected because the caller's version was stale.
    pub fn version_conflicts(&self) -> u64 {
        self.inner.version_conflicts.load(Ordering::Relaxed)
    }

    /// Invoice numbers handed out.
    pub fn numbers_allocated(&self) -> u64 {
        self.inner.numbers_allocated.load(Ordering::Relaxed)
    }

    /// Invoice creations retried after a duplicate number.
    pub fn creation_retries(&self) -> u64 {
        self.inner.creation_retries.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_allowed: self.requests_allowed(),
            requests_rejected: self.requests_rejected(),
            buckets_evicted: self.buckets_evicted(),
            transaction_retries: self.transaction_retries(),
            version_conflicts: self.version_conflicts(),
            numbers_allocated: self.numbers_allocated(),
            creation_retries: self.creation_retries(),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.requests_allowed,
            &inner.requests_rejected,
            &inner.buckets_evicted,
            &inner.transaction_retries,
            &inner.version_conflicts,
            &inner.numbers_allocated,
            &inner.creation_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_rejected: u64,
    pub buckets_evicted: u64,
    pub transaction_retries: u64,
    pub version_conflicts: u64,
    pub numbers_allocated: u64,
    pub creation_retries: u64,
}

impl MetricsSnapshot {
    /// Share of rate-limited requests that were rejected (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been checked.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.requests_rejected as f64 / total as f64
        }
    }

    /// Requests checked by the rate limiter (allowed + rejected).
    pub fn total_requests(&self) -> u64 {
        self.requests_allowed.saturating_add(self.requests_rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_state() {
        assert_eq!(Metrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_rejected();
        metrics.record_evictions(3);
        metrics.record_transaction_retry();
        metrics.record_version_conflict();
        metrics.record_number_allocated();
        metrics.record_creation_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_allowed, 2);
        assert_eq!(snapshot.requests_rejected, 1);
        assert_eq!(snapshot.buckets_evicted, 3);
        assert_eq!(snapshot.transaction_retries, 1);
        assert_eq!(snapshot.version_conflicts, 1);
        assert_eq!(snapshot.numbers_allocated, 1);
        assert_eq!(snapshot.creation_retries, 1);
    }

    #[test]
    fn test_rejection_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().rejection_rate(), 0.0);

        metrics.record_allowed();
        metrics.record_rejected();
        assert!((metrics.snapshot().rejection_rate() - 0.5).abs() < f64::EPSILON);

        metrics.record_rejected();
        metrics.record_rejected();
        assert!((metrics.snapshot().rejection_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(metrics.snapshot().total_requests(), 4);
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.record_allowed();
        metrics.record_version_conflict();
        metrics.record_evictions(2);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics1 = Metrics::new();
        metrics1.record_number_allocated();

        let metrics2 = metrics1.clone();
        metrics2.record_number_allocated();

        assert_eq!(metrics1.numbers_allocated(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let metrics = Metrics::new();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_allowed();
                        m.record_rejected();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.requests_allowed(), 1000);
        assert_eq!(metrics.requests_rejected(), 1000);
    }
}
