//! Background eviction of idle rate limit buckets.
//!
//! Without a sweep, every identity ever seen keeps a bucket for the life of
//! the process. The sweeper periodically drops buckets that have refilled to
//! capacity; admission decisions are unaffected.

use crate::application::ports::Storage;
use crate::application::rate_limiter::{BucketKey, RateLimiter};
use crate::domain::bucket::TokenBucket;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Default pause between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error returned when the sweeper cannot be stopped cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The sweep task panicked.
    #[error("sweeper task panicked")]
    TaskPanicked,
    /// The sweep task was cancelled before it could stop on its own.
    #[error("sweeper task was cancelled")]
    TaskCancelled,
    /// The sweep task had already exited when shutdown was requested.
    #[error("sweeper task exited before shutdown was requested")]
    SignalFailed,
}

/// Error returned for an unusable sweep interval.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sweep interval must be greater than 0")]
pub struct ZeroSweepInterval;

/// Periodically evicts idle buckets from a [`RateLimiter`].
#[derive(Debug)]
pub struct BucketSweeper<S>
where
    S: Storage<BucketKey, TokenBucket>,
{
    limiter: RateLimiter<S>,
    every: Duration,
}

impl<S> BucketSweeper<S>
where
    S: Storage<BucketKey, TokenBucket> + Clone + 'static,
{
    /// Create a sweeper for `limiter`.
    ///
    /// # Errors
    /// Returns [`ZeroSweepInterval`] if `every` is zero.
    pub fn new(limiter: RateLimiter<S>, every: Duration) -> Result<Self, ZeroSweepInterval> {
        if every.is_zero() {
            return Err(ZeroSweepInterval);
        }
        Ok(Self { limiter, every })
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> usize {
        self.limiter.evict_idle()
    }

    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The first sweep happens one interval after start. The task runs until
    /// [`SweeperHandle::shutdown`] is called; dropping the handle leaves it
    /// running.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            tracing::debug!("bucket sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running [`BucketSweeper`].
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep loop and wait for it to exit.
    ///
    /// # Errors
    /// Returns a [`ShutdownError`] if the task panicked, was cancelled, or
    /// was already gone.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        let signalled = self
            .shutdown_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false);

        match (&mut self.task).await {
            Ok(()) if signalled => Ok(()),
            Ok(()) => Err(ShutdownError::SignalFailed),
            Err(e) if e.is_panic() => Err(ShutdownError::TaskPanicked),
            Err(_) => Err(ShutdownError::TaskCancelled),
        }
    }

    /// Whether the sweep task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::metrics::Metrics;
    use crate::domain::tier::{RateLimitConfig, Tier};
    use crate::infrastructure::mocks::MockClock;
    use crate::infrastructure::storage::ShardedStorage;
    use std::sync::Arc;
    use std::time::Instant;

    fn limiter(clock: &MockClock) -> RateLimiter {
        RateLimiter::new(
            Arc::new(ShardedStorage::new()),
            Arc::new(clock.clone()),
            RateLimitConfig::default(),
            Metrics::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_interval_rejected() {
        let clock = MockClock::new(Instant::now());
        let result = BucketSweeper::new(limiter(&clock), Duration::ZERO);
        assert_eq!(result.err(), Some(ZeroSweepInterval));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_periodically_until_shutdown() {
        let clock = MockClock::new(Instant::now());
        let limiter = limiter(&clock);
        limiter.check_and_consume("10.0.0.1", Tier::Sensitive);
        clock.advance(Duration::from_secs(60));

        let handle = BucketSweeper::new(limiter.clone(), Duration::from_secs(1))
            .unwrap()
            .start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.metrics().buckets_evicted(), 1);

        handle.shutdown().await.unwrap();
    }
}
