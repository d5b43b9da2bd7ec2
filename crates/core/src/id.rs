//! Strongly-typed identifiers used across the ledger.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

/// Identifier of an account.
///
/// Opaque to the ledger: provisioning typically hands out UUIDs, but any
/// non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LedgerError::validation("account id must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.0
    }
}

impl From<Uuid> for AccountId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a ledger entry.
///
/// Assigned by the store, strictly increasing and never reused, which is what
/// makes it usable as a keyset pagination key. Always non-negative; `0` means
/// "no entry".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct EntryId(i64);

impl EntryId {
    /// Sentinel used before any entry exists.
    pub const NONE: EntryId = EntryId(0);

    pub fn new(value: i64) -> Result<Self, LedgerError> {
        if value < 0 {
            return Err(LedgerError::validation(format!(
                "entry id must be non-negative, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<EntryId> for i64 {
    fn from(value: EntryId) -> Self {
        value.0
    }
}

impl TryFrom<i64> for EntryId {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
