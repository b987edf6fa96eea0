//! Invoice aggregate.
//!
//! Only the attributes that matter for concurrency control get real
//! semantics here: identity, owner, number and version. Line items are
//! children owned exclusively by their invoice and replaced as a whole.

use crate::domain::sequence::{InvoiceNumber, OwnerKey};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Invoice identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(Uuid);

impl InvoiceId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }

    /// Parse the stored representation.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(InvoiceStatus::Draft),
            "sent" => Some(InvoiceStatus::Sent),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            _ => None,
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One billed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
        }
    }

    /// `quantity * unit_price`.
    pub fn amount(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// Caller-supplied content of an invoice, without identity or version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub client_name: String,
    pub client_email: String,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub line_items: Vec<LineItem>,
}

impl InvoiceDraft {
    /// Draft with no notes and no line items.
    pub fn new(
        client_name: impl Into<String>,
        client_email: impl Into<String>,
        due_date: NaiveDate,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            client_email: client_email.into(),
            due_date,
            notes: None,
            line_items: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }
}

/// Stored invoice with its line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub owner: OwnerKey,
    pub number: InvoiceNumber,
    pub status: InvoiceStatus,
    pub client_name: String,
    pub client_email: String,
    pub due_date: NaiveDate,
    pub notes: Option<String>,
    pub line_items: Vec<LineItem>,
    /// Optimistic-concurrency stamp; starts at 0, +1 per committed update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Build a new, never-saved invoice at version 0.
    pub fn create(
        owner: OwnerKey,
        number: InvoiceNumber,
        draft: InvoiceDraft,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InvoiceId::new(),
            owner,
            number,
            status: InvoiceStatus::Draft,
            client_name: draft.client_name,
            client_email: draft.client_email,
            due_date: draft.due_date,
            notes: draft.notes,
            line_items: draft.line_items,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of all line amounts.
    pub fn total(&self) -> Decimal {
        self.line_items.iter().map(LineItem::amount).sum()
    }
}

/// Edit applied to an invoice under the version guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvoiceMutation {
    /// Replace all editable fields and the full set of line items.
    Replace(InvoiceDraft),
    /// Change only the status.
    SetStatus(InvoiceStatus),
}

impl InvoiceMutation {
    /// Apply the edit to the header in place.
    ///
    /// Returns the new line items when the edit replaces them; the caller is
    /// responsible for persisting the replacement. Version and timestamps are
    /// left alone.
    pub fn apply(self, invoice: &mut Invoice) -> Option<Vec<LineItem>> {
        match self {
            InvoiceMutation::Replace(draft) => {
                invoice.client_name = draft.client_name;
                invoice.client_email = draft.client_email;
                invoice.due_date = draft.due_date;
                invoice.notes = draft.notes;
                invoice.line_items = draft.line_items.clone();
                Some(draft.line_items)
            }
            InvoiceMutation::SetStatus(status) => {
                invoice.status = status;
                None
            }
        }
    }
}
