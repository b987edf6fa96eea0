//! Error taxonomy.
//!
//! Store adapters translate provider-specific failures into [`StoreError`], a
//! closed set the retry logic can reason about without ever looking at raw
//! error codes. [`InvoicingError`] is what callers of the core see.

use crate::domain::invoice::InvoiceId;
use crate::domain::sequence::{CounterExhausted, OwnerKey};
use crate::domain::tier::Tier;
use std::time::Duration;

/// Failure reported by a store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Serialization failure or deadlock; expected to succeed if retried.
    #[error("transient conflict: {0}")]
    TransientConflict(String),
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    /// The statement or transaction ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Anything else.
    #[error("store error: {0}")]
    Other(String),
}

impl From<CounterExhausted> for StoreError {
    fn from(error: CounterExhausted) -> Self {
        StoreError::Other(error.to_string())
    }
}

/// Classification used by retry loops.
pub trait Retryable {
    /// Whether the failure is a store-level transient conflict.
    fn is_transient(&self) -> bool;

    /// Whether the failure is a unique-constraint violation.
    fn is_unique_violation(&self) -> bool {
        false
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientConflict(_))
    }

    fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

/// Errors surfaced by the invoicing core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvoicingError {
    /// The invoice was saved by someone else since the caller loaded it.
    #[error("invoice {id} was modified elsewhere (expected version {expected}, found {actual})")]
    VersionConflict {
        id: InvoiceId,
        expected: u64,
        actual: u64,
    },
    /// The counter row for an owner could not be created.
    #[error("failed to initialize invoice counter for owner {owner}")]
    InitializationFailure { owner: OwnerKey },
    /// The caller's bucket for `tier` is empty.
    #[error("rate limit exceeded for {tier} tier, retry after {retry_after:?}")]
    RateLimitExceeded { tier: Tier, retry_after: Duration },
    /// No invoice with this id.
    #[error("invoice {id} not found")]
    NotFound { id: InvoiceId },
    /// A transaction ran past its configured timeout.
    #[error("transaction exceeded its timeout of {0:?}")]
    Timeout(Duration),
    /// Store failure that was not absorbed by a retry loop.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for InvoicingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Timeout(limit) => InvoicingError::Timeout(limit),
            other => InvoicingError::Store(other),
        }
    }
}

impl Retryable for InvoicingError {
    fn is_transient(&self) -> bool {
        matches!(self, InvoicingError::Store(e) if e.is_transient())
    }

    fn is_unique_violation(&self) -> bool {
        matches!(self, InvoicingError::Store(e) if e.is_unique_violation())
    }
}

impl InvoicingError {
    /// Whether this error reflects a concurrent edit a human has to resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, InvoicingError::VersionConflict { .. })
    }

    /// Text suitable for showing to the end user.
    ///
    /// Infrastructure details never leak; conflicts ask for a refresh.
    pub fn user_message(&self) -> String {
        match self {
            InvoicingError::VersionConflict { .. } => {
                "This invoice was modified elsewhere. Please refresh and try again.".to_string()
            }
            InvoicingError::RateLimitExceeded { retry_after, .. } => format!(
                "Too many requests. Please try again in {} seconds.",
                retry_after.as_secs().max(1)
            ),
            InvoicingError::NotFound { .. } => "Invoice not found.".to_string(),
            InvoicingError::InitializationFailure { .. }
            | InvoicingError::Timeout(_)
            | InvoicingError::Store(_) => "Operation failed, please try again.".to_string(),
        }
    }
}
