//! Mock sleeper for testing.

use crate::application::ports::Sleeper;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Sleeper that records requested delays and returns immediately.
///
/// Retry loops can be driven through every attempt without waiting, and the
/// recorded delays show the backoff schedule that was applied.
///
/// ```
/// use invoice_guard::infrastructure::mocks::MockSleeper;
/// use invoice_guard::application::ports::Sleeper;
/// use std::time::Duration;
///
/// # futures::executor::block_on(async {
/// let sleeper = MockSleeper::new();
/// sleeper.sleep(Duration::from_millis(200)).await;
/// assert_eq!(sleeper.delays(), vec![Duration::from_millis(200)]);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl MockSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.recorded().clone()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.delays
            .lock()
            .expect("MockSleeper mutex poisoned - a test thread panicked while holding the lock")
    }
}

impl Sleeper for MockSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.recorded().push(duration);
        Box::pin(std::future::ready(()))
    }
}
