//! Ledger engine: idempotent credits under concurrent access.
//!
//! ## Credit protocol
//!
//! `apply_credit` runs one unit of work, in this order:
//!
//! 1. lock the account row (`AccountNotFound` if absent)
//! 2. look up the idempotency token (`DuplicateTransaction` if present)
//! 3. relative balance update (`balance = balance + amount`)
//! 4. append the ledger entry
//! 5. re-read the account for the post-mutation balance
//! 6. commit
//!
//! Every failure rolls the unit of work back before returning, so no partial
//! state is ever observable. Same-account credits serialize on the row lock of
//! step 1; the unique index on the token catches the remaining race (same token,
//! different accounts) at step 4.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use moneybox_core::{
    AccountId, CreditAmount, IdempotencyToken, LedgerError, LedgerResult, StoreError,
};

use crate::account::Account;
use crate::entry::NewLedgerEntry;
use crate::store::{LedgerStore, UnitOfWork};

/// Applies credits to account balances and serves account reads.
///
/// Holds no state besides the store handle; clone it freely across tasks.
#[derive(Debug, Clone)]
pub struct LedgerEngine<S> {
    store: S,
    deadline: Option<Duration>,
}

impl<S> LedgerEngine<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            deadline: None,
        }
    }

    /// Bound every credit (connection acquisition and lock waits included).
    ///
    /// On expiry the unit of work is dropped, which rolls it back, and the call
    /// reports `LedgerError::Persistence`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Credit `amount` to `account_id`, exactly once per `token`.
    ///
    /// Only persistence failures log at `error`; duplicates and unknown
    /// accounts are expected outcomes and log below that.
    #[instrument(
        skip(self),
        fields(
            account_id = %account_id,
            idempotency_token = %token,
            amount = %amount
        )
    )]
    pub async fn apply_credit(
        &self,
        account_id: &AccountId,
        token: &IdempotencyToken,
        amount: CreditAmount,
    ) -> LedgerResult<Account> {
        let credit = self.run_credit(account_id, token, amount);

        let result = match self.deadline {
            None => credit.await,
            Some(deadline) => tokio::time::timeout(deadline, credit)
                .await
                .unwrap_or_else(|_| {
                    Err(LedgerError::Persistence(StoreError::Timeout(format!(
                        "credit exceeded deadline of {deadline:?}"
                    ))))
                }),
        };
        result.inspect_err(|err| log_persistence_failure(err, "credit failed"))
    }

    /// Unlocked account read.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_account(&self, account_id: &AccountId) -> LedgerResult<Account> {
        self.store
            .fetch_account(account_id)
            .await
            .map_err(LedgerError::from)
            .inspect_err(|err| log_persistence_failure(err, "account read failed"))?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    async fn run_credit(
        &self,
        account_id: &AccountId,
        token: &IdempotencyToken,
        amount: CreditAmount,
    ) -> LedgerResult<Account> {
        let mut uow = self.store.begin().await?;

        match credit_steps(uow.as_mut(), account_id, token, amount).await {
            Ok(updated) => {
                uow.commit().await?;
                info!(balance = %updated.balance, "credit applied");
                Ok(updated)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    // The connection discards the transaction anyway once it is dropped.
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn log_persistence_failure(err: &LedgerError, message: &str) {
    if let LedgerError::Persistence(cause) = err {
        error!(error = %cause, retryable = err.is_retryable(), "{message}");
    }
}

/// Steps 1-5 of the credit protocol. The caller commits or rolls back.
async fn credit_steps(
    uow: &mut dyn UnitOfWork,
    account_id: &AccountId,
    token: &IdempotencyToken,
    amount: CreditAmount,
) -> LedgerResult<Account> {
    let locked = uow
        .lock_account(account_id)
        .await?
        .ok_or_else(|| {
            debug!("account not found");
            LedgerError::AccountNotFound(account_id.clone())
        })?;
    debug!(balance_before = %locked.balance, "account locked");

    if let Some(existing) = uow.find_entry_by_token(token).await? {
        warn!(entry_id = %existing.id, "transaction was already processed");
        return Err(LedgerError::DuplicateTransaction(token.clone()));
    }

    uow.increment_balance(account_id, amount.value()).await?;

    let entry = NewLedgerEntry::credit(account_id.clone(), amount, token.clone(), Utc::now());
    let stored = uow.insert_entry(entry).await.map_err(|err| {
        if err.is_unique_violation() {
            warn!("idempotency token claimed concurrently");
            LedgerError::DuplicateTransaction(token.clone())
        } else {
            LedgerError::Persistence(err)
        }
    })?;
    debug!(entry_id = %stored.id, "ledger entry appended");

    uow.fetch_account(account_id).await?.ok_or_else(|| {
        LedgerError::Persistence(StoreError::backend(format!(
            "account {account_id} disappeared inside its own unit of work"
        )))
    })
}
