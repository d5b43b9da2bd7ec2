//! Value objects: validated inputs compared by value, not identity.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. Their
/// constructors are the only place where input validation happens, so anything
/// holding one has already passed the ledger's input contract.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Caller-supplied token that makes a credit idempotent.
///
/// Unique across the whole entry set, not per account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn new(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LedgerError::validation("idempotency token must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyToken {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyToken> for String {
    fn from(value: IdempotencyToken) -> Self {
        value.0
    }
}

impl ValueObject for IdempotencyToken {}

/// Strictly positive amount to credit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct CreditAmount(Decimal);

impl CreditAmount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::validation(format!(
                "credit amount must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for CreditAmount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CreditAmount> for Decimal {
    fn from(value: CreditAmount) -> Self {
        value.0
    }
}

impl core::fmt::Display for CreditAmount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl ValueObject for CreditAmount {}
