//! Domain layer - pure business logic with no I/O.
//!
//! This layer contains the core concepts and invariants of the invoicing core:
//! - Token bucket arithmetic and rate limit tiers
//! - Per-owner sequence numbers and their formatting
//! - The invoice aggregate and the edits applied to it
//! - The error taxonomy shared by every layer
//!
//! All types in this layer are pure and easily testable.

pub mod bucket;
pub mod error;
pub mod invoice;
pub mod sequence;
pub mod tier;
