//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Rate limiter (admission decisions) and its bucket sweeper
//! - Transaction coordinator (retry of transient conflicts)
//! - Sequence allocator (per-owner invoice numbers)
//! - Optimistic version guard (conflict-checked invoice writes)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod metrics;
pub mod ports;
pub mod rate_limiter;
pub mod sequence;
pub mod sweeper;
pub mod transaction;
pub mod version_guard;
