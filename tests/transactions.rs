//! Integration tests for transactional retry.

use chrono::{NaiveDate, Utc};
use invoice_guard::infrastructure::mocks::{MockCaptureLayer, MockSleeper};
use invoice_guard::{
    BackoffPolicy, Invoice, InvoiceDraft, InvoiceNumber, InvoiceTransaction, InvoicingError,
    MemoryStore, Metrics, OwnerKey, StoreError, TransactionCoordinator, TransactionOptions,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

struct Harness {
    store: MemoryStore,
    sleeper: MockSleeper,
    metrics: Metrics,
    coordinator: TransactionCoordinator<MemoryStore>,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let sleeper = MockSleeper::new();
    let metrics = Metrics::new();
    let coordinator = TransactionCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(sleeper.clone()),
        metrics.clone(),
    );
    Harness {
        store,
        sleeper,
        metrics,
        coordinator,
    }
}

fn sample_invoice(counter: u64) -> Invoice {
    Invoice::create(
        OwnerKey::new("user-1"),
        InvoiceNumber::format(counter),
        InvoiceDraft::new(
            "Acme",
            "billing@acme.test",
            NaiveDate::from_ymd_opt(2026, 6, 30).unwrap(),
        ),
        Utc::now(),
    )
}

fn transient() -> StoreError {
    StoreError::TransientConflict("could not serialize access".into())
}

#[tokio::test]
async fn test_transient_failure_then_success_takes_two_attempts() {
    let h = harness();
    h.store.fail_next_commit(transient());

    let invoice = sample_invoice(1);
    let calls = AtomicU32::new(0);

    let saved: Result<Invoice, InvoicingError> = h
        .coordinator
        .run("insert_invoice", |tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let invoice = invoice.clone();
            Box::pin(async move {
                tx.insert(&invoice).await?;
                Ok(invoice)
            })
        })
        .await;

    assert_eq!(saved.unwrap().id, invoice.id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.transactions_started(), 2);
    assert_eq!(h.store.commits(), 1);
    assert_eq!(h.store.invoice_count(), 1);
    assert_eq!(h.sleeper.delays(), vec![Duration::from_millis(200)]);
    assert_eq!(h.metrics.transaction_retries(), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let h = harness();
    for _ in 0..5 {
        h.store.fail_next_begin(transient());
    }

    let options = TransactionOptions::default().with_max_retries(2);
    let result: Result<(), InvoicingError> = h
        .coordinator
        .run_with("always_conflicting", &options, |_tx| Box::pin(async { Ok(()) }))
        .await;

    assert!(matches!(
        result,
        Err(InvoicingError::Store(StoreError::TransientConflict(_)))
    ));
    assert_eq!(h.store.transactions_started(), 2);
    assert_eq!(h.store.commits(), 0);
    assert_eq!(h.sleeper.delays(), vec![Duration::from_millis(200)]);
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let h = harness();
    h.store.fail_next_commit(transient());
    h.store.fail_next_commit(transient());

    let result: Result<(), InvoicingError> = h
        .coordinator
        .run("flaky", |_tx| Box::pin(async { Ok(()) }))
        .await;

    assert!(result.is_ok());
    assert_eq!(
        h.sleeper.delays(),
        vec![Duration::from_millis(200), Duration::from_millis(400)]
    );
    assert_eq!(h.sleeper.total(), Duration::from_millis(600));
}

#[tokio::test]
async fn test_custom_backoff_base() {
    let h = harness();
    let coordinator = h
        .coordinator
        .clone()
        .with_backoff(BackoffPolicy::new(Duration::from_millis(10)));
    h.store.fail_next_begin(transient());

    let result: Result<(), InvoicingError> = coordinator
        .run("flaky", |_tx| Box::pin(async { Ok(()) }))
        .await;

    assert!(result.is_ok());
    assert_eq!(h.sleeper.delays(), vec![Duration::from_millis(20)]);
}

#[tokio::test]
async fn test_non_transient_error_is_not_retried() {
    let h = harness();
    let calls = AtomicU32::new(0);

    let result: Result<(), InvoicingError> = h
        .coordinator
        .run("broken", |_tx| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(InvoicingError::from(StoreError::Other(
                    "relation does not exist".into(),
                )))
            })
        })
        .await;

    assert!(matches!(result, Err(InvoicingError::Store(StoreError::Other(_)))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.sleeper.delays().is_empty());
    assert_eq!(h.metrics.transaction_retries(), 0);
}

#[tokio::test]
async fn test_failed_unit_of_work_leaves_no_writes() {
    let h = harness();
    let invoice = sample_invoice(1);

    let result: Result<(), InvoicingError> = h
        .coordinator
        .run("half_done", |tx| {
            let invoice = invoice.clone();
            Box::pin(async move {
                tx.insert(&invoice).await?;
                Err(InvoicingError::from(StoreError::Other(
                    "second statement failed".into(),
                )))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(h.store.invoice_count(), 0);
    assert_eq!(h.store.commits(), 0);
}

#[tokio::test]
async fn test_retry_is_logged_with_attempt_details() {
    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    h.store.fail_next_commit(transient());

    let result: Result<(), InvoicingError> = h
        .coordinator
        .run("update_invoice", |_tx| Box::pin(async { Ok(()) }))
        .await;
    assert!(result.is_ok());

    let retries = capture.with_message("transaction attempt failed, retrying");
    assert_eq!(retries.len(), 1);
    let event = &retries[0];
    assert_eq!(event.level, Level::WARN);
    assert_eq!(event.field("operation"), Some("update_invoice"));
    assert_eq!(event.field("attempt"), Some("1"));
    assert_eq!(event.field("max_attempts"), Some("3"));
    assert_eq!(event.field("delay_ms"), Some("200"));
    assert!(event
        .field("error")
        .is_some_and(|error| error.contains("could not serialize access")));
}

#[tokio::test]
async fn test_exhausted_retries_are_logged_as_error() {
    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    for _ in 0..3 {
        h.store.fail_next_begin(transient());
    }

    let result: Result<(), InvoicingError> = h
        .coordinator
        .run("create_invoice", |_tx| Box::pin(async { Ok(()) }))
        .await;
    assert!(result.is_err());

    let exhausted = capture.with_message("transaction retries exhausted");
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].level, Level::ERROR);
    assert_eq!(exhausted[0].field("attempts"), Some("3"));
    assert_eq!(capture.with_message("transaction attempt failed, retrying").len(), 2);
}
