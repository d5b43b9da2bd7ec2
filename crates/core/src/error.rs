//! Ledger error model.

use thiserror::Error;

use crate::id::AccountId;
use crate::value_object::IdempotencyToken;

/// Result type used across the ledger core.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Failure reported by a store adapter.
///
/// Adapters classify their backend errors into these buckets; the ledger core
/// decides which of them are user-facing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The store could not hand out a connection (or a lock) in time.
    #[error("store timed out: {0}")]
    Timeout(String),

    /// A row could not be decoded into a ledger record.
    #[error("failed to decode row: {0}")]
    Decode(String),

    /// Any other backend failure (network, pool closed, SQL error, ...).
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

/// Ledger-level error.
///
/// `AccountNotFound`, `DuplicateTransaction` and `InvalidCursor` are terminal,
/// user-facing outcomes. They must not be retried. `Persistence` wraps every
/// store failure that is not otherwise classified; retrying it with the same
/// idempotency token is safe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// The idempotency token was already used; the credit was applied before.
    #[error("transaction was already processed: {0}")]
    DuplicateTransaction(IdempotencyToken),

    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),

    /// The caller broke the input contract (non-positive amount, empty token, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_cursor(msg: impl Into<String>) -> Self {
        Self::InvalidCursor(msg.into())
    }

    /// HTTP-equivalent status class for callers that render response envelopes.
    pub fn status_class(&self) -> u16 {
        match self {
            Self::AccountNotFound(_) => 404,
            Self::DuplicateTransaction(_) => 422,
            Self::InvalidCursor(_) | Self::Validation(_) => 400,
            Self::Persistence(_) => 500,
        }
    }

    /// Whether re-issuing the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
