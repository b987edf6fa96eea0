//! Invoice number allocation.

use crate::application::metrics::Metrics;
use crate::application::ports::SequenceStore;
use crate::domain::error::InvoicingError;
use crate::domain::sequence::{InvoiceNumber, OwnerKey};
use std::sync::Arc;

/// Hands out per-owner invoice numbers.
///
/// Uniqueness and ordering come entirely from the store's atomic statements;
/// the allocator holds no lock and keeps no state of its own.
#[derive(Debug)]
pub struct SequenceAllocator<S> {
    store: Arc<S>,
    metrics: Metrics,
}

impl<S> Clone for SequenceAllocator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> SequenceAllocator<S>
where
    S: SequenceStore,
{
    pub fn new(store: Arc<S>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Allocate the next number for `owner`.
    ///
    /// The first call for an owner returns `INV-001`. A number is consumed
    /// even if the caller never uses it.
    ///
    /// # Errors
    /// - `InitializationFailure` if the counter row can neither be incremented
    ///   nor created.
    /// - Store errors, unchanged.
    pub async fn allocate(&self, owner: &OwnerKey) -> Result<InvoiceNumber, InvoicingError> {
        let counter = match self.store.increment(owner).await? {
            Some(counter) => counter,
            None => {
                tracing::debug!(owner = %owner, "no counter row yet, seeding");
                match self.store.upsert(owner).await? {
                    Some(counter) => counter,
                    None => {
                        tracing::error!(owner = %owner, "failed to initialize invoice counter");
                        return Err(InvoicingError::InitializationFailure {
                            owner: owner.clone(),
                        });
                    }
                }
            }
        };

        let number = InvoiceNumber::format(counter);
        self.metrics.record_number_allocated();
        tracing::debug!(owner = %owner, number = %number, "allocated invoice number");
        Ok(number)
    }
}
