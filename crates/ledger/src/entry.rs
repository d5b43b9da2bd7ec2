use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use moneybox_core::{AccountId, CreditAmount, EntryId, IdempotencyToken};

/// An entry ready to be appended to the log (not yet assigned an id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    pub amount: Decimal,
    pub idempotency_token: IdempotencyToken,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn credit(
        account_id: AccountId,
        amount: CreditAmount,
        idempotency_token: IdempotencyToken,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id,
            amount: amount.value(),
            idempotency_token,
            created_at,
        }
    }
}

/// Immutable record of one applied credit.
///
/// `id` is assigned by the store, strictly increasing and never reused; the
/// history paginator uses it as its ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Signed; positive for credits.
    pub amount: Decimal,
    pub idempotency_token: IdempotencyToken,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn from_new(id: EntryId, entry: NewLedgerEntry) -> Self {
        Self {
            id,
            account_id: entry.account_id,
            amount: entry.amount,
            idempotency_token: entry.idempotency_token,
            created_at: entry.created_at,
        }
    }
}
