use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;

use moneybox_core::{AccountId, EntryId, IdempotencyToken, StoreError};
use moneybox_ledger::{Account, LedgerEntry, LedgerStore, NewLedgerEntry, UnitOfWork};

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    /// Ordered by id, like the primary key.
    entries: BTreeMap<EntryId, LedgerEntry>,
    /// Unique index on the idempotency token.
    tokens: HashMap<IdempotencyToken, EntryId>,
}

type AsyncLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    /// One entry per provisioned account.
    row_locks: Mutex<HashMap<AccountId, AsyncLock>>,
    /// Tokens inserted by units of work that have not finished yet. The owner
    /// holds the lock; contenders wait on it.
    pending_tokens: Mutex<HashMap<IdempotencyToken, AsyncLock>>,
    last_entry_id: AtomicI64,
}

impl Shared {
    /// Drop the pending entry for `token` if it is still `lock` and nobody else
    /// references it (the map plus the caller's handle).
    fn forget_token(&self, token: &IdempotencyToken, lock: &AsyncLock) {
        if let Ok(mut pending) = self.pending_tokens.lock() {
            let idle = pending.get(token).is_some_and(|current| {
                Arc::ptr_eq(current, lock) && Arc::strong_count(current) <= 2
            });
            if idle {
                pending.remove(token);
            }
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::backend("lock poisoned")
}

fn token_taken(token: &IdempotencyToken) -> StoreError {
    StoreError::UniqueViolation(format!("idempotency token {token} already exists"))
}

/// A token this unit of work inserted and has not committed yet.
struct TokenClaim {
    token: IdempotencyToken,
    lock: AsyncLock,
    guard: OwnedMutexGuard<()>,
}

/// Handle on a token claimed by another unit of work.
struct TokenWait {
    store: InMemoryLedgerStore,
    token: IdempotencyToken,
    lock: AsyncLock,
}

impl Drop for TokenWait {
    fn drop(&mut self) {
        self.store.shared.forget_token(&self.token, &self.lock);
    }
}

enum TokenSlot {
    Claimed(TokenClaim),
    Busy(TokenWait),
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Mirrors the Postgres store's semantics:
/// - `lock_account` holds a per-account async mutex until commit/rollback
/// - writes are staged and become visible atomically on commit
/// - entry ids come from a sequence, so rolled back inserts leave gaps
/// - inserting a token that another unfinished unit of work holds waits for
///   that unit of work, then fails if it committed and proceeds if it rolled
///   back (the unique index behaves the same way in Postgres)
/// - locking an account that was never provisioned locks nothing
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an account. Not part of the ledger protocol.
    pub fn create_account(
        &self,
        id: &AccountId,
        name: &str,
        balance: Decimal,
    ) -> Result<Account, StoreError> {
        let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
        if tables.accounts.contains_key(id) {
            return Err(StoreError::UniqueViolation(format!(
                "account {id} already exists"
            )));
        }
        let account = Account::open(id.clone(), name, Utc::now()).with_balance(balance);
        tables.accounts.insert(id.clone(), account.clone());
        self.shared
            .row_locks
            .lock()
            .map_err(|_| poisoned())?
            .insert(id.clone(), AsyncLock::default());
        Ok(account)
    }

    /// Every committed entry, oldest first.
    pub fn all_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.entries.values().cloned().collect())
    }

    /// `None` when the account was never provisioned.
    fn row_lock(&self, id: &AccountId) -> Result<Option<AsyncLock>, StoreError> {
        let locks = self.shared.row_locks.lock().map_err(|_| poisoned())?;
        Ok(locks.get(id).cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(InMemoryUnitOfWork {
            store: self.clone(),
            row_guards: HashMap::new(),
            balance_deltas: HashMap::new(),
            touched_at: HashMap::new(),
            inserted: Vec::new(),
            claims: Vec::new(),
        }))
    }

    async fn fetch_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.accounts.get(id).cloned())
    }

    async fn list_entries(
        &self,
        account_id: &AccountId,
        before: Option<EntryId>,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        let upper = match before {
            Some(bound) => tables.entries.range(..bound),
            None => tables.entries.range(..),
        };
        Ok(upper
            .rev()
            .map(|(_, entry)| entry)
            .filter(|entry| &entry.account_id == account_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_entries(&self, account_id: &AccountId) -> Result<u64, StoreError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .entries
            .values()
            .filter(|entry| &entry.account_id == account_id)
            .count() as u64)
    }
}

struct InMemoryUnitOfWork {
    store: InMemoryLedgerStore,
    row_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    balance_deltas: HashMap<AccountId, Decimal>,
    touched_at: HashMap<AccountId, DateTime<Utc>>,
    inserted: Vec<LedgerEntry>,
    claims: Vec<TokenClaim>,
}

impl InMemoryUnitOfWork {
    fn shared(&self) -> &Shared {
        &self.store.shared
    }

    /// Committed row plus this unit of work's own staged writes.
    fn view_account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let tables = self.shared().tables.read().map_err(|_| poisoned())?;
        Ok(tables.accounts.get(id).cloned().map(|mut account| {
            if let Some(delta) = self.balance_deltas.get(id) {
                account.balance += *delta;
            }
            if let Some(at) = self.touched_at.get(id) {
                account.updated_at = *at;
            }
            account
        }))
    }

    /// Claim `entry`'s token, or report who holds it.
    fn try_claim(&self, entry: &NewLedgerEntry) -> Result<TokenSlot, StoreError> {
        let token = &entry.idempotency_token;
        let tables = self.shared().tables.read().map_err(|_| poisoned())?;
        if !tables.accounts.contains_key(&entry.account_id) {
            return Err(StoreError::backend(format!(
                "foreign key violation: account {} does not exist",
                entry.account_id
            )));
        }
        if tables.tokens.contains_key(token) {
            return Err(token_taken(token));
        }

        let mut pending = self.shared().pending_tokens.lock().map_err(|_| poisoned())?;
        let lock = pending.entry(token.clone()).or_default().clone();
        let slot = match lock.clone().try_lock_owned() {
            Ok(guard) => TokenSlot::Claimed(TokenClaim {
                token: token.clone(),
                lock,
                guard,
            }),
            Err(_) => TokenSlot::Busy(TokenWait {
                store: self.store.clone(),
                token: token.clone(),
                lock,
            }),
        };
        Ok(slot)
    }

    fn release_claims(&mut self) {
        for TokenClaim { token, lock, guard } in self.claims.drain(..) {
            drop(guard);
            self.store.shared.forget_token(&token, &lock);
        }
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        self.release_claims();
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        if !self.row_guards.contains_key(id) {
            // FOR UPDATE on a missing row locks nothing.
            let Some(lock) = self.store.row_lock(id)? else {
                return Ok(None);
            };
            let guard = lock.lock_owned().await;
            self.row_guards.insert(id.clone(), guard);
        }

        self.view_account(id)
    }

    async fn find_entry_by_token(
        &mut self,
        token: &IdempotencyToken,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        if let Some(own) = self.inserted.iter().find(|e| &e.idempotency_token == token) {
            return Ok(Some(own.clone()));
        }
        let tables = self.shared().tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .tokens
            .get(token)
            .and_then(|id| tables.entries.get(id))
            .cloned())
    }

    async fn increment_balance(
        &mut self,
        id: &AccountId,
        amount: Decimal,
    ) -> Result<(), StoreError> {
        let exists = self
            .shared()
            .tables
            .read()
            .map_err(|_| poisoned())?
            .accounts
            .contains_key(id);
        if !exists {
            return Err(StoreError::backend(format!(
                "balance update touched 0 rows for account {id}"
            )));
        }

        *self.balance_deltas.entry(id.clone()).or_default() += amount;
        self.touched_at.insert(id.clone(), Utc::now());
        Ok(())
    }

    async fn insert_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        if self.claims.iter().any(|c| c.token == entry.idempotency_token) {
            return Err(token_taken(&entry.idempotency_token));
        }
        loop {
            match self.try_claim(&entry)? {
                TokenSlot::Claimed(claim) => {
                    self.claims.push(claim);
                    break;
                }
                TokenSlot::Busy(wait) => {
                    // Returns once the holder commits or rolls back.
                    drop(wait.lock.lock().await);
                }
            }
        }

        let raw_id = self.shared().last_entry_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = EntryId::new(raw_id).map_err(|e| StoreError::backend(e.to_string()))?;
        let stored = LedgerEntry::from_new(id, entry);
        self.inserted.push(stored.clone());
        Ok(stored)
    }

    async fn fetch_account(&mut self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        self.view_account(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        {
            let mut tables = this.shared().tables.write().map_err(|_| poisoned())?;

            for (id, delta) in &this.balance_deltas {
                let account = tables.accounts.get_mut(id).ok_or_else(|| {
                    StoreError::backend(format!("account {id} vanished before commit"))
                })?;
                account.balance += *delta;
                if let Some(at) = this.touched_at.get(id) {
                    account.updated_at = *at;
                }
            }

            for entry in &this.inserted {
                tables.tokens.insert(entry.idempotency_token.clone(), entry.id);
                tables.entries.insert(entry.id, entry.clone());
            }
        }

        // Tokens are visible in the table before contenders wake up.
        this.release_claims();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // Staged writes are discarded; Drop releases token claims and row locks.
        Ok(())
    }
}
