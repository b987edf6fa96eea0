//! Transactional retry of multi-statement writes.
//!
//! The coordinator opens a transaction, hands it to a unit of work and commits
//! the result. Transient conflicts reported by the store (serialization
//! failures, deadlocks) are retried with exponential backoff; every other
//! failure is returned untouched on the first attempt.

use crate::application::metrics::Metrics;
use crate::application::ports::{Sleeper, StoreTransaction, TransactionalStore};
use crate::domain::error::{Retryable, StoreError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Isolation level requested for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Per-call transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// Total number of attempts, including the first one.
    ///
    /// Zero is treated as one: the unit of work always runs at least once
    /// and a zero never turns into an error without touching the store.
    pub max_retries: u32,
    /// Upper bound for one attempt, from `begin` to `commit`.
    pub timeout_ms: u64,
    pub isolation_level: IsolationLevel,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 5_000,
            isolation_level: IsolationLevel::ReadCommitted,
        }
    }
}

impl TransactionOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Attempts actually made; a configured zero still runs once.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Exponential backoff: `base * 2^attempt` for the 1-based attempt that just
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before retrying after `attempt` failed.
    ///
    /// ```
    /// use invoice_guard::BackoffPolicy;
    /// use std::time::Duration;
    ///
    /// let backoff = BackoffPolicy::default();
    /// assert_eq!(backoff.delay(1), Duration::from_millis(200));
    /// assert_eq!(backoff.delay(2), Duration::from_millis(400));
    /// ```
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

/// Runs units of work inside store transactions, retrying transient conflicts.
///
/// The coordinator knows nothing about invoices; the unit of work decides what
/// to read and write and which error type to return.
pub struct TransactionCoordinator<S> {
    store: Arc<S>,
    sleeper: Arc<dyn Sleeper>,
    backoff: BackoffPolicy,
    defaults: TransactionOptions,
    metrics: Metrics,
}

impl<S> Clone for TransactionCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            sleeper: Arc::clone(&self.sleeper),
            backoff: self.backoff,
            defaults: self.defaults,
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> fmt::Debug for TransactionCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("backoff", &self.backoff)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl<S> TransactionCoordinator<S>
where
    S: TransactionalStore,
{
    pub fn new(store: Arc<S>, sleeper: Arc<dyn Sleeper>, metrics: Metrics) -> Self {
        Self {
            store,
            sleeper,
            backoff: BackoffPolicy::default(),
            defaults: TransactionOptions::default(),
            metrics,
        }
    }

    /// Replace the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the options used by [`run`](Self::run).
    pub fn with_defaults(mut self, defaults: TransactionOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub(crate) fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `work` with the default options.
    pub async fn run<T, E, F>(&self, operation: &'static str, work: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Retryable + fmt::Display + Send,
        F: for<'t> FnMut(&'t mut S::Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let options = self.defaults;
        self.run_with(operation, &options, work).await
    }

    /// Run `work` inside a transaction, retrying transient conflicts.
    ///
    /// `work` may be invoked once per attempt, each time with a fresh
    /// transaction; it must not carry state between attempts. The transaction
    /// is committed when `work` succeeds and rolled back when it fails.
    ///
    /// # Errors
    /// - The first non-transient error, unchanged.
    /// - The last transient error once `options.max_retries` attempts failed.
    pub async fn run_with<T, E, F>(
        &self,
        operation: &'static str,
        options: &TransactionOptions,
        mut work: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Retryable + fmt::Display + Send,
        F: for<'t> FnMut(&'t mut S::Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let max_attempts = options.attempts();
        let mut attempt = 1;

        loop {
            let error = match self.attempt(options, &mut work).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                tracing::debug!(operation, attempt, error = %error, "transaction failed");
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    operation,
                    attempts = attempt,
                    error = %error,
                    "transaction retries exhausted"
                );
                return Err(error);
            }

            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transaction attempt failed, retrying"
            );
            self.metrics.record_transaction_retry();
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt<T, E, F>(&self, options: &TransactionOptions, work: &mut F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: for<'t> FnMut(&'t mut S::Transaction) -> BoxFuture<'t, Result<T, E>>,
    {
        let timeout = options.timeout();
        let run = async {
            let mut tx = self.store.begin(options).await?;
            match work(&mut tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(error) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::warn!(error = %rollback_error, "rollback failed");
                    }
                    Err(error)
                }
            }
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            // The dropped transaction rolls back.
            Err(_) => Err(E::from(StoreError::Timeout(timeout))),
        }
    }
}
