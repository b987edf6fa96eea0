//! In-process invoice store.
//!
//! Implements every store port without a database. Transactions are fully
//! serialized: `begin` takes a store-wide async lock and works on a private
//! copy of the invoice table that replaces the committed table on commit.
//! Reads outside a transaction see committed state only and never wait for an
//! open transaction. Sequence counters live outside the transactional table
//! and are updated atomically per owner, like single auto-committed
//! statements.
//!
//! Faults can be queued for `begin` and `commit` to exercise retry paths.

use crate::application::ports::{
    InvoiceStore, InvoiceTransaction, SequenceStore, StoreTransaction, TransactionalStore,
};
use crate::application::transaction::{IsolationLevel, TransactionOptions};
use crate::domain::error::StoreError;
use crate::domain::invoice::{Invoice, InvoiceId, LineItem};
use crate::domain::sequence::{OwnerKey, SequenceCounter};
use ahash::RandomState;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Default)]
struct InvoiceTable {
    rows: HashMap<InvoiceId, Invoice>,
}

impl InvoiceTable {
    fn number_taken(&self, candidate: &Invoice) -> bool {
        self.rows
            .values()
            .any(|row| row.owner == candidate.owner && row.number == candidate.number)
    }

    fn row_mut(&mut self, id: InvoiceId) -> Result<&mut Invoice, StoreError> {
        self.rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Other(format!("invoice {id} does not exist")))
    }
}

#[derive(Debug, Default)]
struct Faults {
    begin: VecDeque<StoreError>,
    commit: VecDeque<StoreError>,
}

/// Store that keeps everything in memory.
///
/// Cloning is cheap and clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: DashMap<OwnerKey, SequenceCounter, RandomState>,
    committed: RwLock<InvoiceTable>,
    writer: Arc<tokio::sync::Mutex<()>>,
    faults: Mutex<Faults>,
    transactions_started: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `begin` fail with `error`. Queued faults fire in order.
    pub fn fail_next_begin(&self, error: StoreError) {
        self.faults().begin.push_back(error);
    }

    /// Make the next `commit` fail with `error` and discard its writes.
    pub fn fail_next_commit(&self, error: StoreError) {
        self.faults().commit.push_back(error);
    }

    /// Write an invoice as-is, bypassing numbering and versioning.
    ///
    /// Waits for any open transaction to finish.
    pub async fn seed_invoice(&self, invoice: Invoice) {
        let _writer = self.inner.writer.lock().await;
        self.committed_mut().rows.insert(invoice.id, invoice);
    }

    /// Current counter value for `owner`, if the row exists.
    pub fn counter(&self, owner: &OwnerKey) -> Option<u64> {
        self.inner.counters.get(owner).map(|row| row.counter)
    }

    /// Number of committed invoices.
    pub fn invoice_count(&self) -> usize {
        self.committed().rows.len()
    }

    /// Transactions opened so far, including those that failed.
    pub fn transactions_started(&self) -> u64 {
        self.inner.transactions_started.load(Ordering::Relaxed)
    }

    /// Transactions committed so far.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn committed(&self) -> std::sync::RwLockReadGuard<'_, InvoiceTable> {
        self.inner
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn committed_mut(&self) -> std::sync::RwLockWriteGuard<'_, InvoiceTable> {
        self.inner
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl SequenceStore for MemoryStore {
    async fn increment(&self, owner: &OwnerKey) -> Result<Option<u64>, StoreError> {
        match self.inner.counters.get_mut(owner) {
            Some(mut row) => Ok(Some(row.advance(Utc::now())?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, owner: &OwnerKey) -> Result<Option<u64>, StoreError> {
        let now = Utc::now();
        match self.inner.counters.entry(owner.clone()) {
            Entry::Occupied(mut row) => Ok(Some(row.get_mut().advance(now)?)),
            Entry::Vacant(slot) => {
                let row = slot.insert(SequenceCounter::first(owner.clone(), now));
                Ok(Some(row.counter))
            }
        }
    }
}

impl TransactionalStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self, options: &TransactionOptions) -> Result<MemoryTransaction, StoreError> {
        // Opening a transaction is a round trip; let other tasks run.
        tokio::task::yield_now().await;
        self.inner.transactions_started.fetch_add(1, Ordering::Relaxed);

        let fault = self.faults().begin.pop_front();
        if let Some(error) = fault {
            return Err(error);
        }

        let lock = Arc::clone(&self.inner.writer).lock_owned().await;
        let staged = self.committed().clone();

        Ok(MemoryTransaction {
            _lock: lock,
            staged,
            store: self.clone(),
            isolation_level: options.isolation_level,
        })
    }
}

impl InvoiceStore for MemoryStore {
    async fn current_version(&self, id: InvoiceId) -> Result<Option<u64>, StoreError> {
        Ok(self.committed().rows.get(&id).map(|row| row.version))
    }

    async fn find(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.committed().rows.get(&id).cloned())
    }
}

/// Open [`MemoryStore`] transaction.
///
/// Holds the store-wide write lock until committed, rolled back or dropped.
#[derive(Debug)]
pub struct MemoryTransaction {
    _lock: OwnedMutexGuard<()>,
    staged: InvoiceTable,
    store: MemoryStore,
    isolation_level: IsolationLevel,
}

impl MemoryTransaction {
    /// Level requested at `begin`. Execution is always serial regardless.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }
}

impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        let fault = self.store.faults().commit.pop_front();
        if let Some(error) = fault {
            return Err(error);
        }
        *self.store.committed_mut() = self.staged;
        self.store.inner.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl InvoiceTransaction for MemoryTransaction {
    async fn load_for_update(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.staged.rows.get(&id).cloned())
    }

    async fn insert(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        if self.staged.number_taken(invoice) {
            return Err(StoreError::UniqueViolation(format!(
                "invoice number {} already used by owner {}",
                invoice.number, invoice.owner
            )));
        }
        if self.staged.rows.contains_key(&invoice.id) {
            return Err(StoreError::UniqueViolation(format!(
                "invoice id {} already exists",
                invoice.id
            )));
        }
        self.staged.rows.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn replace_line_items(
        &mut self,
        id: InvoiceId,
        items: &[LineItem],
    ) -> Result<(), StoreError> {
        self.staged.row_mut(id)?.line_items = items.to_vec();
        Ok(())
    }

    async fn save_header(&mut self, invoice: &Invoice) -> Result<u64, StoreError> {
        let row = self.staged.row_mut(invoice.id)?;
        row.status = invoice.status;
        row.client_name = invoice.client_name.clone();
        row.client_email = invoice.client_email.clone();
        row.due_date = invoice.due_date;
        row.notes = invoice.notes.clone();
        row.updated_at = invoice.updated_at;
        row.version += 1;
        Ok(row.version)
    }

    async fn delete(&mut self, id: InvoiceId) -> Result<bool, StoreError> {
        Ok(self.staged.rows.remove(&id).is_some())
    }
}
