//! Optimistic concurrency for invoice edits.
//!
//! Every invoice carries a version. A writer states which version it last saw;
//! the write only lands if the stored version still matches, and landing bumps
//! the version by exactly one. The check runs twice: once against committed
//! state before any transaction is opened (cheap rejection of stale forms),
//! and again on the locked row inside the transaction (the authoritative
//! check).

use crate::application::metrics::Metrics;
use crate::application::ports::{InvoiceStore, InvoiceTransaction};
use crate::application::sequence::SequenceAllocator;
use crate::application::transaction::TransactionCoordinator;
use crate::domain::error::{InvoicingError, Retryable};
use crate::domain::invoice::{Invoice, InvoiceDraft, InvoiceId, InvoiceMutation};
use crate::domain::sequence::OwnerKey;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

/// Default number of allocate+insert cycles for one creation.
pub const DEFAULT_CREATION_ATTEMPTS: u32 = 3;

/// Version-checked writes to invoices.
pub struct OptimisticVersionGuard<S> {
    coordinator: TransactionCoordinator<S>,
    allocator: SequenceAllocator<S>,
    creation_attempts: u32,
}

impl<S> Clone for OptimisticVersionGuard<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            allocator: self.allocator.clone(),
            creation_attempts: self.creation_attempts,
        }
    }
}

impl<S> fmt::Debug for OptimisticVersionGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticVersionGuard")
            .field("coordinator", &self.coordinator)
            .field("creation_attempts", &self.creation_attempts)
            .finish_non_exhaustive()
    }
}

impl<S> OptimisticVersionGuard<S>
where
    S: InvoiceStore,
    S::Transaction: InvoiceTransaction,
{
    /// Build a guard on top of a coordinator; numbers are allocated from the
    /// coordinator's store.
    pub fn new(coordinator: TransactionCoordinator<S>) -> Self {
        let allocator = SequenceAllocator::new(
            Arc::clone(coordinator.store()),
            coordinator.metrics().clone(),
        );
        Self {
            coordinator,
            allocator,
            creation_attempts: DEFAULT_CREATION_ATTEMPTS,
        }
    }

    /// Set how many allocate+insert cycles a creation may use (at least one).
    pub fn with_creation_attempts(mut self, attempts: u32) -> Self {
        self.creation_attempts = attempts.max(1);
        self
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<S> {
        &self.coordinator
    }

    pub fn allocator(&self) -> &SequenceAllocator<S> {
        &self.allocator
    }

    fn metrics(&self) -> &Metrics {
        self.coordinator.metrics()
    }

    /// Apply `mutation` if the invoice is still at `expected_version`.
    ///
    /// With `expected_version = None` both checks are skipped but the version
    /// is still bumped, so later version-checked writers notice the change.
    /// Line items are replaced as a whole in the same transaction as the
    /// version bump.
    ///
    /// # Errors
    /// - `NotFound` if the invoice does not exist.
    /// - `VersionConflict` if someone else saved first. Never retried.
    /// - Store errors once the coordinator gives up.
    pub async fn update_with_version(
        &self,
        id: InvoiceId,
        expected_version: Option<u64>,
        mutation: InvoiceMutation,
    ) -> Result<Invoice, InvoicingError> {
        self.precheck(id, expected_version).await?;

        let now = Utc::now();
        let result: Result<Invoice, InvoicingError> = self
            .coordinator
            .run("update_invoice", move |tx| {
                let mutation = mutation.clone();
                Box::pin(async move {
                    let mut invoice = tx
                        .load_for_update(id)
                        .await?
                        .ok_or(InvoicingError::NotFound { id })?;
                    check_version(id, expected_version, invoice.version)?;

                    if let Some(items) = mutation.apply(&mut invoice) {
                        tx.replace_line_items(id, &items).await?;
                    }
                    invoice.updated_at = now;
                    invoice.version = tx.save_header(&invoice).await?;
                    Ok(invoice)
                })
            })
            .await;

        match &result {
            Ok(invoice) => {
                tracing::debug!(invoice_id = %id, version = invoice.version, "invoice updated")
            }
            Err(error) => self.note_failure("update_invoice", id, error),
        }
        result
    }

    /// Delete the invoice and its line items if it is still at
    /// `expected_version`.
    ///
    /// # Errors
    /// Same as [`update_with_version`](Self::update_with_version).
    pub async fn delete_with_version(
        &self,
        id: InvoiceId,
        expected_version: Option<u64>,
    ) -> Result<(), InvoicingError> {
        self.precheck(id, expected_version).await?;

        let result: Result<(), InvoicingError> = self
            .coordinator
            .run("delete_invoice", move |tx| {
                Box::pin(async move {
                    let invoice = tx
                        .load_for_update(id)
                        .await?
                        .ok_or(InvoicingError::NotFound { id })?;
                    check_version(id, expected_version, invoice.version)?;

                    if tx.delete(id).await? {
                        Ok(())
                    } else {
                        Err(InvoicingError::NotFound { id })
                    }
                })
            })
            .await;

        match &result {
            Ok(()) => tracing::debug!(invoice_id = %id, "invoice deleted"),
            Err(error) => self.note_failure("delete_invoice", id, error),
        }
        result
    }

    /// Create an invoice with a freshly allocated number.
    ///
    /// Allocation and insert form one unit. If the insert hits a duplicate
    /// number the whole unit is repeated with a new number, up to the
    /// configured number of attempts, backing off between attempts. Numbers
    /// consumed by failed attempts are not reused.
    ///
    /// # Errors
    /// - The unique violation of the last attempt once attempts run out.
    /// - Any other error immediately.
    pub async fn create_invoice(
        &self,
        owner: &OwnerKey,
        draft: InvoiceDraft,
    ) -> Result<Invoice, InvoicingError> {
        let mut attempt = 1;

        loop {
            let error = match self.try_create(owner, &draft).await {
                Ok(invoice) => {
                    tracing::debug!(
                        owner = %owner,
                        invoice_id = %invoice.id,
                        number = %invoice.number,
                        "invoice created"
                    );
                    return Ok(invoice);
                }
                Err(error) => error,
            };

            if !error.is_unique_violation() || attempt >= self.creation_attempts {
                tracing::error!(
                    operation = "create_invoice",
                    owner = %owner,
                    attempts = attempt,
                    error = %error,
                    "invoice creation failed"
                );
                return Err(error);
            }

            let delay = self.coordinator.backoff().delay(attempt);
            tracing::warn!(
                operation = "create_invoice",
                owner = %owner,
                attempt,
                max_attempts = self.creation_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "duplicate invoice number, retrying"
            );
            self.metrics().record_creation_retry();
            self.coordinator.sleeper().sleep(delay).await;
            attempt += 1;
        }
    }

    async fn try_create(
        &self,
        owner: &OwnerKey,
        draft: &InvoiceDraft,
    ) -> Result<Invoice, InvoicingError> {
        let number = self.allocator.allocate(owner).await?;
        let invoice = Invoice::create(owner.clone(), number, draft.clone(), Utc::now());

        self.coordinator
            .run("create_invoice", move |tx| {
                let invoice = invoice.clone();
                Box::pin(async move {
                    tx.insert(&invoice).await?;
                    Ok(invoice)
                })
            })
            .await
    }

    /// Load an invoice with its line items.
    ///
    /// # Errors
    /// `NotFound` if the invoice does not exist.
    pub async fn find(&self, id: InvoiceId) -> Result<Invoice, InvoicingError> {
        self.coordinator
            .store()
            .find(id)
            .await?
            .ok_or(InvoicingError::NotFound { id })
    }

    async fn precheck(
        &self,
        id: InvoiceId,
        expected_version: Option<u64>,
    ) -> Result<(), InvoicingError> {
        let current = self
            .coordinator
            .store()
            .current_version(id)
            .await?
            .ok_or(InvoicingError::NotFound { id })?;

        let checked = check_version(id, expected_version, current);
        if let Err(error) = &checked {
            self.note_failure("version_precheck", id, error);
        }
        checked
    }

    fn note_failure(&self, operation: &'static str, id: InvoiceId, error: &InvoicingError) {
        match error {
            InvoicingError::VersionConflict {
                expected, actual, ..
            } => {
                self.metrics().record_version_conflict();
                tracing::warn!(
                    operation,
                    invoice_id = %id,
                    expected,
                    actual,
                    "version conflict"
                );
            }
            InvoicingError::NotFound { .. } => {
                tracing::debug!(operation, invoice_id = %id, "invoice not found")
            }
            other => tracing::error!(operation, invoice_id = %id, error = %other, "invoice write failed"),
        }
    }
}

fn check_version(id: InvoiceId, expected: Option<u64>, actual: u64) -> Result<(), InvoicingError> {
    match expected {
        Some(expected) if expected != actual => Err(InvoicingError::VersionConflict {
            id,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}
