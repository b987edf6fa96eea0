//! Time adapters.
//!
//! [`SystemClock`] reads the monotonic clock and [`TokioSleeper`] suspends on
//! the tokio timer. Tests substitute `MockClock` and `MockSleeper` from
//! `crate::infrastructure::mocks` (feature `test-helpers`).

use crate::application::ports::{Clock, Sleeper};
use futures::future::BoxFuture;
use std::time::{Duration, Instant};

/// System clock implementation using `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl TokioSleeper {
    pub fn new() -> Self {
        Self
    }
}

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
