//! Service facade.
//!
//! Wires the four components together the way a request handler uses them:
//! every call is admitted by the rate limiter first, then runs through the
//! version guard (and, for creation, the sequence allocator) inside the
//! transaction coordinator.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, InvoiceStore, InvoiceTransaction, Sleeper};
use crate::application::rate_limiter::{Identity, RateLimitResult, RateLimiter};
use crate::application::sweeper::{BucketSweeper, ShutdownError, SweeperHandle};
use crate::application::transaction::{BackoffPolicy, TransactionCoordinator, TransactionOptions};
use crate::application::version_guard::{OptimisticVersionGuard, DEFAULT_CREATION_ATTEMPTS};
use crate::domain::error::InvoicingError;
use crate::domain::invoice::{Invoice, InvoiceDraft, InvoiceId, InvoiceMutation, InvoiceStatus};
use crate::domain::sequence::{InvoiceNumber, OwnerKey};
use crate::domain::tier::{ConfigError, RateLimitConfig};
use crate::infrastructure::clock::{SystemClock, TokioSleeper};
use crate::infrastructure::storage::ShardedStorage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::Instrument;

/// Error returned when building an [`InvoicingService`] fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A rate limit tier is unusable.
    #[error("rate limit configuration error: {0}")]
    RateLimit(#[from] ConfigError),
    /// Transactions need a non-zero timeout.
    #[error("transaction timeout must be greater than 0")]
    ZeroTransactionTimeout,
    /// Creation needs at least one attempt.
    #[error("creation attempts must be greater than 0")]
    ZeroCreationAttempts,
    /// A configured sweep interval must be non-zero.
    #[error("sweep interval must be greater than 0")]
    ZeroSweepInterval,
}

/// Everything tunable about the service, loadable from any serde format.
///
/// Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub rate_limits: RateLimitConfig,
    pub transactions: TransactionOptions,
    /// Allocate+insert cycles per creation.
    pub creation_attempts: u32,
    /// Base of the exponential backoff shared by transaction and creation
    /// retries.
    pub backoff_base_ms: u64,
    /// Idle bucket sweep period; `None` disables the background sweep.
    pub sweep_interval_ms: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            transactions: TransactionOptions::default(),
            creation_attempts: DEFAULT_CREATION_ATTEMPTS,
            backoff_base_ms: 100,
            sweep_interval_ms: None,
        }
    }
}

impl ServiceConfig {
    /// Check every setting.
    ///
    /// # Errors
    /// The first invalid setting found.
    pub fn validate(&self) -> Result<(), BuildError> {
        self.rate_limits.validate()?;
        if self.transactions.timeout_ms == 0 {
            return Err(BuildError::ZeroTransactionTimeout);
        }
        if self.creation_attempts == 0 {
            return Err(BuildError::ZeroCreationAttempts);
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(BuildError::ZeroSweepInterval);
        }
        Ok(())
    }
}

/// Builder for constructing an [`InvoicingService`].
pub struct InvoicingServiceBuilder<S> {
    store: Arc<S>,
    config: ServiceConfig,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    metrics: Option<Metrics>,
}

impl<S> InvoicingServiceBuilder<S>
where
    S: InvoiceStore + 'static,
    S::Transaction: InvoiceTransaction,
{
    /// Replace the whole configuration.
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-tier rate limits.
    pub fn with_rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.config.rate_limits = rate_limits;
        self
    }

    /// Set the default transaction options.
    pub fn with_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.config.transactions = options;
        self
    }

    /// Set how many allocate+insert cycles a creation may use.
    ///
    /// The value will be validated when `build()` is called.
    pub fn with_creation_attempts(mut self, attempts: u32) -> Self {
        self.config.creation_attempts = attempts;
        self
    }

    /// Set the backoff base delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base_ms = base.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Sweep idle buckets every `interval` on a background task.
    ///
    /// `build()` must then run inside a tokio runtime.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_ms = Some(interval.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a custom sleeper (mainly for testing).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Share an existing metrics tracker.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    /// Returns a [`BuildError`] if the configuration is invalid.
    pub fn build(self) -> Result<InvoicingService<S>, BuildError> {
        self.config.validate()?;

        let metrics = self.metrics.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper::new()));

        let limiter: RateLimiter = RateLimiter::new(
            Arc::new(ShardedStorage::new()),
            clock,
            self.config.rate_limits,
            metrics.clone(),
        )?;

        let coordinator = TransactionCoordinator::new(self.store, sleeper, metrics.clone())
            .with_defaults(self.config.transactions)
            .with_backoff(BackoffPolicy::new(Duration::from_millis(
                self.config.backoff_base_ms,
            )));
        let guard = OptimisticVersionGuard::new(coordinator)
            .with_creation_attempts(self.config.creation_attempts);

        let sweeper = match self.config.sweep_interval_ms {
            Some(ms) => Some(
                BucketSweeper::new(limiter.clone(), Duration::from_millis(ms))
                    .map_err(|_| BuildError::ZeroSweepInterval)?
                    .start(),
            ),
            None => None,
        };

        Ok(InvoicingService {
            limiter,
            guard,
            metrics,
            sweeper: Mutex::new(sweeper),
        })
    }
}

/// Rate-limited, conflict-checked invoice operations.
///
/// # Example
///
/// ```
/// use invoice_guard::{Identity, InvoicingService, MemoryStore};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let service = InvoicingService::builder(MemoryStore::new()).build().unwrap();
/// let caller = Identity::User("user-1".into());
///
/// let number = service.next_invoice_number(&caller, &"user-1".into()).await.unwrap();
/// assert_eq!(number.as_str(), "INV-001");
/// # });
/// ```
pub struct InvoicingService<S> {
    limiter: RateLimiter,
    guard: OptimisticVersionGuard<S>,
    metrics: Metrics,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<S> std::fmt::Debug for InvoicingService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoicingService")
            .field("limiter", &self.limiter)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl<S> InvoicingService<S>
where
    S: InvoiceStore + 'static,
    S::Transaction: InvoiceTransaction,
{
    /// Create a builder over `store`.
    ///
    /// Defaults:
    /// - Tiers: 100 (authenticated), 20 (anonymous), 5 (sensitive) per minute
    /// - Transactions: 3 attempts, 5s timeout, read committed
    /// - Creation: 3 allocate+insert attempts
    /// - Backoff base: 100ms
    /// - Background sweep: disabled
    pub fn builder(store: S) -> InvoicingServiceBuilder<S> {
        InvoicingServiceBuilder {
            store: Arc::new(store),
            config: ServiceConfig::default(),
            clock: None,
            sleeper: None,
            metrics: None,
        }
    }

    /// Admit a request that does not write invoices, e.g. a page view or a
    /// login attempt (`sensitive`).
    ///
    /// # Errors
    /// `RateLimitExceeded` when the caller is out of tokens.
    pub fn admit(
        &self,
        identity: &Identity,
        sensitive: bool,
    ) -> Result<RateLimitResult, InvoicingError> {
        self.limiter.admit(identity, sensitive)
    }

    /// Allocate a number without creating an invoice.
    pub async fn next_invoice_number(
        &self,
        identity: &Identity,
        owner: &OwnerKey,
    ) -> Result<InvoiceNumber, InvoicingError> {
        let span = tracing::debug_span!("allocate_number", identity = %identity, owner = %owner);
        async {
            self.limiter.admit(identity, false)?;
            self.guard.allocator().allocate(owner).await
        }
        .instrument(span)
        .await
    }

    /// Create an invoice for `owner`.
    pub async fn create_invoice(
        &self,
        identity: &Identity,
        owner: &OwnerKey,
        draft: InvoiceDraft,
    ) -> Result<Invoice, InvoicingError> {
        let span = tracing::debug_span!("create_invoice", identity = %identity, owner = %owner);
        async {
            self.limiter.admit(identity, false)?;
            self.guard.create_invoice(owner, draft).await
        }
        .instrument(span)
        .await
    }

    /// Replace the editable fields and line items of an invoice.
    pub async fn update_invoice(
        &self,
        identity: &Identity,
        id: InvoiceId,
        expected_version: Option<u64>,
        draft: InvoiceDraft,
    ) -> Result<Invoice, InvoicingError> {
        self.mutate(identity, id, expected_version, InvoiceMutation::Replace(draft))
            .await
    }

    /// Change the status of an invoice.
    pub async fn set_status(
        &self,
        identity: &Identity,
        id: InvoiceId,
        expected_version: Option<u64>,
        status: InvoiceStatus,
    ) -> Result<Invoice, InvoicingError> {
        self.mutate(identity, id, expected_version, InvoiceMutation::SetStatus(status))
            .await
    }

    async fn mutate(
        &self,
        identity: &Identity,
        id: InvoiceId,
        expected_version: Option<u64>,
        mutation: InvoiceMutation,
    ) -> Result<Invoice, InvoicingError> {
        let span = tracing::debug_span!("update_invoice", identity = %identity, invoice_id = %id);
        async {
            self.limiter.admit(identity, false)?;
            self.guard
                .update_with_version(id, expected_version, mutation)
                .await
        }
        .instrument(span)
        .await
    }

    /// Delete an invoice.
    pub async fn delete_invoice(
        &self,
        identity: &Identity,
        id: InvoiceId,
        expected_version: Option<u64>,
    ) -> Result<(), InvoicingError> {
        let span = tracing::debug_span!("delete_invoice", identity = %identity, invoice_id = %id);
        async {
            self.limiter.admit(identity, false)?;
            self.guard.delete_with_version(id, expected_version).await
        }
        .instrument(span)
        .await
    }

    /// Load an invoice.
    pub async fn get_invoice(
        &self,
        identity: &Identity,
        id: InvoiceId,
    ) -> Result<Invoice, InvoicingError> {
        self.limiter.admit(identity, false)?;
        self.guard.find(id).await
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn guard(&self) -> &OptimisticVersionGuard<S> {
        &self.guard
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop the background sweep, if one is running.
    ///
    /// # Errors
    /// Returns an error if the sweep task fails to shut down gracefully.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        // Release the lock before awaiting.
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }
}
