//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.
//!
//! Store ports are split by access pattern:
//! - [`SequenceStore`] runs single atomic statements outside any transaction
//! - [`TransactionalStore`] opens transactions for multi-statement writes
//! - [`InvoiceStore`] and [`InvoiceTransaction`] add the invoice reads and
//!   writes needed by the version guard

use crate::application::transaction::TransactionOptions;
use crate::domain::error::StoreError;
use crate::domain::invoice::{Invoice, InvoiceId, LineItem};
use crate::domain::sequence::OwnerKey;
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Port for obtaining current time.
///
/// This abstraction allows the application layer to work with time
/// without depending on system clock implementation details.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Port for suspending between retry attempts.
///
/// Injected so tests can drive many attempts without waiting on the wall
/// clock (TokioSleeper in production, MockSleeper in tests).
pub trait Sleeper: Send + Sync + Debug {
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Port for concurrent key-value storage.
///
/// This abstraction allows the application layer to store and retrieve values
/// without depending on specific concurrent data structure implementations.
/// Infrastructure provides concrete implementations (ShardedStorage).
///
/// `with_entry_mut` must give the accessor exclusive access to the entry for
/// the duration of the call.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    ///
    /// # Returns
    /// The result from the accessor function
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Iterate over all entries, providing access to both key and value.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Port for atomic counter statements.
///
/// Each method must execute as one indivisible statement in the store; no
/// application-level lock is taken around them.
pub trait SequenceStore: Send + Sync {
    /// Increment the owner's counter and return the new value, or `None` if the
    /// owner has no counter row yet.
    fn increment(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    /// Insert the owner's counter at 1, or increment it if a concurrent caller
    /// created it first, returning the resulting value.
    ///
    /// `None` means the row could not be written or read back.
    fn upsert(
        &self,
        owner: &OwnerKey,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;
}

/// A transaction handle.
///
/// Dropping a transaction without committing must roll it back.
pub trait StoreTransaction: Send {
    /// Make every write of the transaction visible atomically.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Discard every write of the transaction.
    fn rollback(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Port for stores that support multi-statement transactions.
pub trait TransactionalStore: Send + Sync {
    type Transaction: StoreTransaction;

    /// Open a transaction honouring the isolation level and timeout.
    fn begin(
        &self,
        options: &TransactionOptions,
    ) -> impl Future<Output = Result<Self::Transaction, StoreError>> + Send;
}

/// Invoice reads and writes inside a transaction.
pub trait InvoiceTransaction: StoreTransaction {
    /// Load the invoice and lock it until the transaction ends.
    fn load_for_update(
        &mut self,
        id: InvoiceId,
    ) -> impl Future<Output = Result<Option<Invoice>, StoreError>> + Send;

    /// Insert a brand-new invoice with its line items.
    ///
    /// Fails with `StoreError::UniqueViolation` when the owner already has an
    /// invoice with the same number.
    fn insert(&mut self, invoice: &Invoice) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete every line item of the invoice and insert `items` in order.
    fn replace_line_items(
        &mut self,
        id: InvoiceId,
        items: &[LineItem],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write the header fields and increment the stored version by one,
    /// returning the new version.
    fn save_header(
        &mut self,
        invoice: &Invoice,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete the invoice and its line items. Returns whether a row existed.
    fn delete(&mut self, id: InvoiceId) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Invoice reads outside any transaction.
pub trait InvoiceStore: TransactionalStore + SequenceStore {
    /// Current version of the invoice, or `None` if it does not exist.
    fn current_version(
        &self,
        id: InvoiceId,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    /// Load the invoice with its line items.
    fn find(&self, id: InvoiceId)
        -> impl Future<Output = Result<Option<Invoice>, StoreError>> + Send;
}
