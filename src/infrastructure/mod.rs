//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock and sleep abstractions (system time vs mock)
//! - Storage implementations (sharded maps for rate limit buckets)
//! - Invoice stores (in-memory, PostgreSQL)
//! - The service facade wiring everything together

pub mod clock;
pub mod memory_store;
pub mod service;
pub mod storage;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides controllable test doubles for time,
/// retry delays and log output.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// invoice-guard = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
