//! Postgres-backed ledger store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` | Idempotency token already used |
//! | Database (lock not available / query canceled) | `55P03` / `57014` | `Timeout` | `lock_timeout` or `statement_timeout` hit |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolTimedOut | N/A | `Timeout` | No connection within `acquire_timeout` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `Decode` | Row does not match the schema |
//! | Other | N/A | `Backend` | Network errors, pool closed, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresLedgerStore` is `Send + Sync` and can be shared across tasks. Each
//! unit of work owns one pooled connection for its whole lifetime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use moneybox_core::{AccountId, EntryId, IdempotencyToken, StoreError};
use moneybox_ledger::{Account, LedgerEntry, LedgerStore, NewLedgerEntry, UnitOfWork};

/// Schema required by this store (accounts, entry log, load-bearing indexes).
pub const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

const ACCOUNT_COLUMNS: &str = "id, name, balance, created_at, updated_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, idempotency_token, created_at";

/// Postgres-backed ledger store.
///
/// ## Row Locking
///
/// `lock_account` issues `SELECT ... FOR UPDATE`, so concurrent credits to the
/// same account queue on the row lock while credits to other accounts proceed.
///
/// ## Idempotency
///
/// The unique index on `ledger_entries.idempotency_token` is what guarantees
/// exactly-once application across processes. A concurrent insert of the same
/// token blocks until the first transaction finishes and then fails with
/// `23505`, which surfaces as `StoreError::UniqueViolation`.
///
/// ## Lock Timeout
///
/// With [`with_lock_timeout`](Self::with_lock_timeout) every unit of work sets
/// `lock_timeout` for its transaction, so a waiter gives up server-side too
/// (`55P03`, surfacing as `StoreError::Timeout`) instead of keeping its
/// connection busy after the caller stopped waiting.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    lock_timeout: Option<Duration>,
}

impl PostgresLedgerStore {
    /// Create a new PostgresLedgerStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout: None,
        }
    }

    /// Bound row lock and unique index waits inside each unit of work.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    /// Apply [`SCHEMA`]. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("install_schema", e))?;
        Ok(())
    }

    /// Provision an account. Not part of the ledger protocol; used for seeding
    /// and tests.
    #[instrument(skip(self), fields(account_id = %id), err)]
    pub async fn create_account(
        &self,
        id: &AccountId,
        name: &str,
        balance: Decimal,
    ) -> Result<Account, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (id, name, balance) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(name)
        .bind(balance)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        decode_account(&row)
    }
}

/// `lock_timeout` value for `timeout`. Never `0ms`, which would disable it.
fn lock_timeout_setting(timeout: Duration) -> String {
    format!("{}ms", timeout.as_millis().max(1))
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(lock_timeout) = self.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(lock_timeout_setting(lock_timeout))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        }

        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_account", e))?;

        row.as_ref().map(decode_account).transpose()
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        before: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE account_id = $1
                AND ($2::bigint IS NULL OR id < $2)
            ORDER BY id DESC
            LIMIT $3
            "#
        ))
        .bind(account_id.as_str())
        .bind(before.map(EntryId::get))
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        rows.iter().map(decode_entry).collect()
    }

    async fn count_entries(&self, account_id: &AccountId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM ledger_entries WHERE account_id = $1")
            .bind(account_id.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_entries", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::decode(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }
}

/// One Postgres transaction. Dropping it without committing rolls back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_account", e))?;

        row.as_ref().map(decode_account).transpose()
    }

    async fn find_entry_by_token(
        &mut self,
        token: &IdempotencyToken,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_token = $1"
        ))
        .bind(token.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_entry_by_token", e))?;

        row.as_ref().map(decode_entry).transpose()
    }

    async fn increment_balance(
        &mut self,
        id: &AccountId,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_str())
        .bind(amount)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("increment_balance", e))?;

        if result.rows_affected() != 1 {
            return Err(StoreError::backend(format!(
                "balance update touched {} rows for account {id}",
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ledger_entries (account_id, amount, idempotency_token, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(entry.account_id.as_str())
        .bind(entry.amount)
        .bind(entry.idempotency_token.as_str())
        .bind(entry.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::decode(format!("failed to read entry id: {e}")))?;
        let id = EntryId::new(id).map_err(|e| StoreError::decode(e.to_string()))?;

        Ok(LedgerEntry::from_new(id, entry))
    }

    async fn fetch_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_account_in_tx", e))?;

        row.as_ref().map(decode_account).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("55P03") | Some("57014") => StoreError::Timeout(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("no connection available for {operation}"))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: String,
    name: String,
    balance: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            balance: row.try_get("balance")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: AccountId::new(row.id).map_err(|e| StoreError::decode(e.to_string()))?,
            name: row.name,
            balance: row.balance,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct EntryRow {
    id: i64,
    account_id: String,
    amount: Decimal,
    idempotency_token: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EntryRow {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            amount: row.try_get("amount")?,
            idempotency_token: row.try_get("idempotency_token")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let decode = |e: moneybox_core::LedgerError| StoreError::decode(e.to_string());
        Ok(LedgerEntry {
            id: EntryId::new(row.id).map_err(decode)?,
            account_id: AccountId::new(row.account_id).map_err(decode)?,
            amount: row.amount,
            idempotency_token: IdempotencyToken::new(row.idempotency_token).map_err(decode)?,
            created_at: row.created_at,
        })
    }
}

fn decode_account(row: &PgRow) -> Result<Account, StoreError> {
    AccountRow::from_row(row)
        .map_err(|e| StoreError::decode(format!("failed to deserialize account row: {e}")))?
        .try_into()
}

fn decode_entry(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    EntryRow::from_row(row)
        .map_err(|e| StoreError::decode(format!("failed to deserialize entry row: {e}")))?
        .try_into()
}
