use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use moneybox_core::AccountId;

/// Account as persisted by the store.
///
/// The ledger never creates or deletes accounts; provisioning is done by an
/// external collaborator. Only [`crate::LedgerEngine`] mutates `balance`, and it
/// only ever adds to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh zero-balance account, as provisioning would create it.
    pub fn open(id: AccountId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance = balance;
        self
    }
}
