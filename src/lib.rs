//! # invoice-guard
//!
//! Concurrency-safety core for an invoicing application.
//!
//! Several browser tabs, users and background jobs write the same owner's data
//! at the same time. This crate keeps those writes correct:
//!
//! - **[`RateLimiter`]**: token-bucket admission per caller and tier
//! - **[`TransactionCoordinator`]**: runs multi-statement writes in a
//!   transaction and retries transient conflicts with exponential backoff
//! - **[`SequenceAllocator`]**: strictly increasing, gap-tolerant invoice
//!   numbers per owner (`INV-001`, `INV-002`, ...)
//! - **[`OptimisticVersionGuard`]**: version-checked edits, so a stale form
//!   never silently overwrites a newer save
//!
//! [`InvoicingService`] wires the four together behind one facade.
//!
//! ## Quick Start
//!
//! ```rust
//! use invoice_guard::{Identity, InvoiceDraft, InvoicingService, LineItem, MemoryStore, OwnerKey};
//! use rust_decimal::Decimal;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let service = InvoicingService::builder(MemoryStore::new()).build().unwrap();
//! let caller = Identity::User("user-42".into());
//! let owner = OwnerKey::new("user-42");
//!
//! let due = chrono::NaiveDate::from_ymd_opt(2026, 12, 31).unwrap();
//! let draft = InvoiceDraft::new("Acme", "billing@acme.test", due)
//!     .with_line_item(LineItem::new("Consulting", Decimal::from(2), Decimal::from(150)));
//! let invoice = service.create_invoice(&caller, &owner, draft).await.unwrap();
//! assert_eq!(invoice.number.as_str(), "INV-001");
//! assert_eq!(invoice.version, 0);
//! # });
//! ```
//!
//! ## Optimistic Versioning
//!
//! Every invoice carries a `version`. Pass the version the caller last saw;
//! the write lands only if nobody saved in between, and bumps it by one:
//!
//! ```rust
//! # use invoice_guard::{Identity, InvoiceDraft, InvoiceStatus, InvoicingError, InvoicingService, MemoryStore, OwnerKey};
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! # let service = InvoicingService::builder(MemoryStore::new()).build().unwrap();
//! # let caller = Identity::User("user-42".into());
//! # let draft = InvoiceDraft::new("Acme", "billing@acme.test", chrono::NaiveDate::from_ymd_opt(2026, 12, 31).unwrap());
//! # let invoice = service.create_invoice(&caller, &OwnerKey::new("user-42"), draft).await.unwrap();
//! let sent = service
//!     .set_status(&caller, invoice.id, Some(invoice.version), InvoiceStatus::Sent)
//!     .await
//!     .unwrap();
//! assert_eq!(sent.version, invoice.version + 1);
//!
//! // A second tab still holding the old version is refused.
//! let stale = service
//!     .set_status(&caller, invoice.id, Some(invoice.version), InvoiceStatus::Paid)
//!     .await;
//! assert!(matches!(stale, Err(InvoicingError::VersionConflict { .. })));
//! # });
//! ```
//!
//! ## Rate Limiting
//!
//! Three tiers, each with its own bucket per caller:
//!
//! | Tier | Default | Applies to |
//! |------|---------|------------|
//! | authenticated | 100 / minute | signed-in users |
//! | anonymous | 20 / minute | unauthenticated traffic, per address |
//! | sensitive | 5 / minute | login and registration attempts, per address |
//!
//! Rejections carry a retry-after duration; [`RateLimitResult::headers`]
//! renders the usual `X-RateLimit-*` response headers.
//!
//! ## Observability
//!
//! Retries, conflicts and rejections are logged through `tracing` and counted
//! in [`Metrics`]:
//!
//! ```rust
//! # use invoice_guard::{InvoicingService, MemoryStore};
//! # let service = InvoicingService::builder(MemoryStore::new()).build().unwrap();
//! let snapshot = service.metrics().snapshot();
//! println!("rejection rate: {:.2}%", snapshot.rejection_rate() * 100.0);
//! println!("transaction retries: {}", snapshot.transaction_retries);
//! ```
//!
//! ## Stores
//!
//! - [`MemoryStore`]: in-process store with fault injection, for tests and
//!   single-node use
//! - `PostgresStore` (feature `postgres`): the production adapter, backed by
//!   `sqlx`

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    bucket::TokenBucket,
    error::{InvoicingError, Retryable, StoreError},
    invoice::{Invoice, InvoiceDraft, InvoiceId, InvoiceMutation, InvoiceStatus, LineItem},
    sequence::{CounterExhausted, InvoiceNumber, OwnerKey, SequenceCounter},
    tier::{ConfigError, RateLimitConfig, Tier, TierLimits},
};

pub use application::{
    metrics::{Metrics, MetricsSnapshot},
    ports::{
        Clock, InvoiceStore, InvoiceTransaction, SequenceStore, Sleeper, Storage,
        StoreTransaction, TransactionalStore,
    },
    rate_limiter::{BucketKey, Identity, RateLimitResult, RateLimiter},
    sequence::SequenceAllocator,
    sweeper::{BucketSweeper, ShutdownError, SweeperHandle, ZeroSweepInterval},
    transaction::{BackoffPolicy, IsolationLevel, TransactionCoordinator, TransactionOptions},
    version_guard::OptimisticVersionGuard,
};

pub use infrastructure::{
    clock::{SystemClock, TokioSleeper},
    memory_store::{MemoryStore, MemoryTransaction},
    service::{BuildError, InvoicingService, InvoicingServiceBuilder, ServiceConfig},
    storage::ShardedStorage,
};

#[cfg(feature = "postgres")]
pub use infrastructure::postgres::{PostgresStore, PostgresTransaction};
