//! Persistence boundary of the ledger.
//!
//! The ledger makes no storage assumptions beyond what these ports promise.
//! Implementations live in `moneybox-infra` (Postgres for production, in-memory
//! for tests/dev).

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use moneybox_core::{AccountId, EntryId, IdempotencyToken, StoreError};

use crate::account::Account;
use crate::entry::{LedgerEntry, NewLedgerEntry};

/// An atomic, all-or-nothing group of store operations.
///
/// Nothing written through a unit of work is visible to anyone else until
/// [`UnitOfWork::commit`] succeeds. Dropping a unit of work without committing
/// must behave like [`UnitOfWork::rollback`].
///
/// ## Implementation Requirements
///
/// - `lock_account` takes an exclusive row lock held until commit/rollback, so
///   concurrent units of work against the same account serialize. Units of work
///   against different accounts must not block each other.
/// - `increment_balance` is a relative update (`balance = balance + amount`)
///   against the stored value, never a write-back of a previously read value.
/// - `insert_entry` assigns a strictly increasing id and rejects a reused
///   idempotency token with [`StoreError::UniqueViolation`], including tokens
///   written by other, not yet committed units of work.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Read an account, locking its row for update.
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    /// Look up an entry by idempotency token (no lock).
    async fn find_entry_by_token(
        &mut self,
        token: &IdempotencyToken,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// `balance = balance + amount`, bumping `updated_at`.
    async fn increment_balance(&mut self, id: &AccountId, amount: Decimal)
    -> Result<(), StoreError>;

    /// Append an entry, returning it with its store-assigned id.
    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    /// Read an account as seen by this unit of work (including its own writes).
    async fn fetch_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Relational store holding accounts and the append-only entry log.
///
/// Reads on this trait take no locks and observe committed state only.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Start a unit of work. Blocks until a connection is available (or the
    /// store's acquisition timeout expires, reported as [`StoreError::Timeout`]).
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Unlocked account read.
    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    /// Entries of `account_id` with `id < before` (all entries when `before` is
    /// `None`), newest first, at most `limit` rows.
    async fn list_entries(
        &self,
        account_id: &AccountId,
        before: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Total number of entries of `account_id`.
    async fn count_entries(&self, account_id: &AccountId) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        (**self).begin().await
    }

    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        (**self).fetch_account(id).await
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        before: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).list_entries(account_id, before, limit).await
    }

    async fn count_entries(&self, account_id: &AccountId) -> Result<u64, StoreError> {
        (**self).count_entries(account_id).await
    }
}
