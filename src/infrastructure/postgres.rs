//! PostgreSQL store.
//!
//! Maps the store ports onto three tables (see `migrations/`). SQLSTATE codes
//! are translated at this boundary: `40001` (serialization failure) and
//! `40P01` (deadlock) become transient conflicts, `23505` a unique violation
//! and `57014` (statement timeout) a timeout. Nothing above this module ever
//! sees a raw database error.
//!
//! Requires the `postgres` feature.

use crate::application::ports::{
    InvoiceStore, InvoiceTransaction, SequenceStore, StoreTransaction, TransactionalStore,
};
use crate::application::transaction::TransactionOptions;
use crate::domain::error::StoreError;
use crate::domain::invoice::{Invoice, InvoiceId, InvoiceStatus, LineItem};
use crate::domain::sequence::{InvoiceNumber, OwnerKey};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_invoicing.sql");

const INVOICE_COLUMNS: &str = "id, owner_key, invoice_number, status, client_name, \
     client_email, due_date, notes, version, created_at, updated_at";

/// Translate a driver error into the store taxonomy.
///
/// `timeout` is the statement timeout in force, reported when the server
/// cancels a statement for running too long.
pub fn classify(error: sqlx::Error, timeout: Option<Duration>) -> StoreError {
    match &error {
        sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
            Some("40001") | Some("40P01") => {
                StoreError::TransientConflict(db_error.message().to_string())
            }
            Some("23505") => StoreError::UniqueViolation(
                db_error
                    .constraint()
                    .unwrap_or_else(|| db_error.message())
                    .to_string(),
            ),
            Some("57014") => match timeout {
                Some(limit) => StoreError::Timeout(limit),
                None => StoreError::Other(db_error.message().to_string()),
            },
            _ => StoreError::Other(error.to_string()),
        },
        _ => StoreError::Other(error.to_string()),
    }
}

fn to_version(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Other(format!("negative version {raw}")))
}

fn to_counter(raw: Option<i64>) -> Result<Option<u64>, StoreError> {
    raw.map(|value| {
        u64::try_from(value).map_err(|_| StoreError::Other(format!("negative counter {value}")))
    })
    .transpose()
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    owner_key: String,
    invoice_number: String,
    status: String,
    client_name: String,
    client_email: String,
    due_date: NaiveDate,
    notes: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_invoice(self, line_items: Vec<LineItem>) -> Result<Invoice, StoreError> {
        let status = InvoiceStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Other(format!("unknown invoice status {}", self.status)))?;
        Ok(Invoice {
            id: InvoiceId::from_uuid(self.id),
            owner: OwnerKey::new(self.owner_key),
            number: InvoiceNumber::from_raw(self.invoice_number),
            status,
            client_name: self.client_name,
            client_email: self.client_email,
            due_date: self.due_date,
            notes: self.notes,
            line_items,
            version: to_version(self.version)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LineItemRow {
    description: String,
    quantity: Decimal,
    unit_price: Decimal,
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        LineItem::new(row.description, row.quantity, row.unit_price)
    }
}

async fn fetch_invoice(
    conn: &mut PgConnection,
    id: InvoiceId,
    for_update: bool,
    timeout: Option<Duration>,
) -> Result<Option<Invoice>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1{lock}");

    let row = sqlx::query_as::<_, InvoiceRow>(&sql)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify(e, timeout))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let items = sqlx::query_as::<_, LineItemRow>(
        "SELECT description, quantity, unit_price FROM line_items \
         WHERE invoice_id = $1 ORDER BY position",
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| classify(e, timeout))?;

    row.into_invoice(items.into_iter().map(LineItem::from).collect())
        .map(Some)
}

async fn insert_line_items(
    conn: &mut PgConnection,
    id: InvoiceId,
    items: &[LineItem],
    timeout: Option<Duration>,
) -> Result<(), StoreError> {
    for (position, item) in items.iter().enumerate() {
        let position = i32::try_from(position)
            .map_err(|_| StoreError::Other("too many line items".to_string()))?;
        sqlx::query(
            "INSERT INTO line_items (invoice_id, position, description, quantity, unit_price) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id.as_uuid())
        .bind(position)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, timeout))?;
    }
    Ok(())
}

/// Store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, None))?;
        }
        tracing::debug!("invoicing schema ensured");
        Ok(())
    }
}

impl SequenceStore for PostgresStore {
    async fn increment(&self, owner: &OwnerKey) -> Result<Option<u64>, StoreError> {
        let counter: Option<i64> = sqlx::query_scalar(
            "UPDATE sequence_counter SET counter = counter + 1, updated_at = now() \
             WHERE owner_key = $1 RETURNING counter",
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, None))?;
        to_counter(counter)
    }

    async fn upsert(&self, owner: &OwnerKey) -> Result<Option<u64>, StoreError> {
        let counter: Option<i64> = sqlx::query_scalar(
            "INSERT INTO sequence_counter (owner_key, counter, updated_at) VALUES ($1, 1, now()) \
             ON CONFLICT (owner_key) DO UPDATE \
             SET counter = sequence_counter.counter + 1, updated_at = now() \
             RETURNING counter",
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, None))?;
        to_counter(counter)
    }
}

impl TransactionalStore for PostgresStore {
    type Transaction = PostgresTransaction;

    async fn begin(&self, options: &TransactionOptions) -> Result<PostgresTransaction, StoreError> {
        let timeout = Some(options.timeout());
        let mut tx = self.pool.begin().await.map_err(|e| classify(e, timeout))?;

        let isolation = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            options.isolation_level.as_sql()
        );
        sqlx::query(&isolation)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, timeout))?;

        let statement_timeout = format!("SET LOCAL statement_timeout = {}", options.timeout_ms);
        sqlx::query(&statement_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, timeout))?;

        Ok(PostgresTransaction { tx, timeout })
    }
}

impl InvoiceStore for PostgresStore {
    async fn current_version(&self, id: InvoiceId) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM invoices WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify(e, None))?;
        version.map(to_version).transpose()
    }

    async fn find(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(|e| classify(e, None))?;
        fetch_invoice(&mut conn, id, false, None).await
    }
}

/// Open PostgreSQL transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StoreTransaction for PostgresTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        let timeout = self.timeout;
        self.tx.commit().await.map_err(|e| classify(e, timeout))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        let timeout = self.timeout;
        self.tx.rollback().await.map_err(|e| classify(e, timeout))
    }
}

impl InvoiceTransaction for PostgresTransaction {
    async fn load_for_update(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        fetch_invoice(&mut self.tx, id, true, self.timeout).await
    }

    async fn insert(&mut self, invoice: &Invoice) -> Result<(), StoreError> {
        let timeout = self.timeout;
        let version = i64::try_from(invoice.version)
            .map_err(|_| StoreError::Other("version out of range".to_string()))?;

        sqlx::query(
            "INSERT INTO invoices (id, owner_key, invoice_number, status, client_name, \
             client_email, due_date, notes, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.owner.as_str())
        .bind(invoice.number.as_str())
        .bind(invoice.status.as_str())
        .bind(&invoice.client_name)
        .bind(&invoice.client_email)
        .bind(invoice.due_date)
        .bind(invoice.notes.as_deref())
        .bind(version)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, timeout))?;

        insert_line_items(&mut self.tx, invoice.id, &invoice.line_items, timeout).await
    }

    async fn replace_line_items(
        &mut self,
        id: InvoiceId,
        items: &[LineItem],
    ) -> Result<(), StoreError> {
        let timeout = self.timeout;
        sqlx::query("DELETE FROM line_items WHERE invoice_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, timeout))?;

        insert_line_items(&mut self.tx, id, items, timeout).await
    }

    async fn save_header(&mut self, invoice: &Invoice) -> Result<u64, StoreError> {
        let timeout = self.timeout;
        let version: Option<i64> = sqlx::query_scalar(
            "UPDATE invoices SET status = $2, client_name = $3, client_email = $4, \
             due_date = $5, notes = $6, updated_at = $7, version = version + 1 \
             WHERE id = $1 RETURNING version",
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.status.as_str())
        .bind(&invoice.client_name)
        .bind(&invoice.client_email)
        .bind(invoice.due_date)
        .bind(invoice.notes.as_deref())
        .bind(invoice.updated_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| classify(e, timeout))?;

        match version {
            Some(version) => to_version(version),
            None => Err(StoreError::Other(format!(
                "invoice {} does not exist",
                invoice.id
            ))),
        }
    }

    async fn delete(&mut self, id: InvoiceId) -> Result<bool, StoreError> {
        let timeout = self.timeout;
        let result = sqlx::query("DELETE FROM invoices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, timeout))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_splits_into_statements() {
        let statements: Vec<_> = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(statements.len(), 4);
        assert!(statements[1].contains("invoices_owner_number_key"));
    }

    #[test]
    fn test_non_database_errors_are_other() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound, None),
            StoreError::Other(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut, Some(Duration::from_secs(5))),
            StoreError::Other(_)
        ));
    }

    #[test]
    fn test_counter_conversion() {
        assert_eq!(to_counter(None), Ok(None));
        assert_eq!(to_counter(Some(7)), Ok(Some(7)));
        assert!(to_counter(Some(-1)).is_err());
    }
}
