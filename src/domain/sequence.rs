//! Per-owner sequence numbers.
//!
//! Every owner has one counter that only ever moves forward. Formatted numbers
//! are unique and increasing per owner but not contiguous: a number handed out
//! to a create that later fails is never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every formatted invoice number.
pub const INVOICE_NUMBER_PREFIX: &str = "INV-";

/// Minimum number of digits after the prefix.
pub const MIN_DIGITS: usize = 3;

/// Identity that owns counters and invoices (typically a user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// The counter of `owner` is at `u64::MAX` and cannot hand out another number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sequence counter for {owner} is exhausted")]
pub struct CounterExhausted {
    pub owner: OwnerKey,
}

/// Persisted counter row for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    pub owner: OwnerKey,
    pub counter: u64,
    pub updated_at: DateTime<Utc>,
}

impl SequenceCounter {
    /// Counter row as it looks right after the first allocation.
    pub fn first(owner: OwnerKey, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            counter: 1,
            updated_at: now,
        }
    }

    /// Advance the counter by one and return the new value.
    ///
    /// # Errors
    /// `CounterExhausted` at `u64::MAX`; the row is left untouched.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Result<u64, CounterExhausted> {
        self.counter = self.counter.checked_add(1).ok_or_else(|| CounterExhausted {
            owner: self.owner.clone(),
        })?;
        self.updated_at = now;
        Ok(self.counter)
    }
}

/// Human-readable invoice number such as `INV-042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceNumber(String);

impl InvoiceNumber {
    /// Format a counter value: prefix plus at least three zero-padded digits.
    ///
    /// ```
    /// use invoice_guard::InvoiceNumber;
    ///
    /// assert_eq!(InvoiceNumber::format(1).as_str(), "INV-001");
    /// assert_eq!(InvoiceNumber::format(1234).as_str(), "INV-1234");
    /// ```
    pub fn format(counter: u64) -> Self {
        Self(format!(
            "{INVOICE_NUMBER_PREFIX}{counter:0width$}",
            width = MIN_DIGITS
        ))
    }

    /// Wrap an already formatted number, e.g. one read back from the store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Counter value encoded in the number, if it has the standard shape.
    pub fn counter(&self) -> Option<u64> {
        self.0
            .strip_prefix(INVOICE_NUMBER_PREFIX)
            .and_then(|digits| digits.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pads_to_three_digits() {
        assert_eq!(InvoiceNumber::format(1).as_str(), "INV-001");
        assert_eq!(InvoiceNumber::format(42).as_str(), "INV-042");
        assert_eq!(InvoiceNumber::format(999).as_str(), "INV-999");
    }

    #[test]
    fn test_format_grows_without_truncation() {
        assert_eq!(InvoiceNumber::format(1000).as_str(), "INV-1000");
        assert_eq!(InvoiceNumber::format(1234).as_str(), "INV-1234");
        assert_eq!(InvoiceNumber::format(1_000_000).as_str(), "INV-1000000");
    }

    #[test]
    fn test_counter_parses_back() {
        assert_eq!(InvoiceNumber::format(42).counter(), Some(42));
        assert_eq!(InvoiceNumber::from_raw("LEGACY-7").counter(), None);
    }

    #[test]
    fn test_counter_advance() {
        let now = Utc::now();
        let mut counter = SequenceCounter::first(OwnerKey::new("user-1"), now);
        assert_eq!(counter.counter, 1);
        assert_eq!(counter.advance(now), Ok(2));
        assert_eq!(counter.advance(now), Ok(3));
    }

    #[test]
    fn test_counter_never_repeats_at_max() {
        let earlier = Utc::now();
        let mut counter = SequenceCounter {
            owner: OwnerKey::new("user-1"),
            counter: u64::MAX,
            updated_at: earlier,
        };

        let error = counter.advance(Utc::now()).unwrap_err();
        assert_eq!(error.owner, OwnerKey::new("user-1"));
        assert_eq!(counter.counter, u64::MAX);
        assert_eq!(counter.updated_at, earlier);
    }
}
