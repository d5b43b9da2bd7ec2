//! `moneybox-core`: ledger foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod value_object;

pub use error::{LedgerError, LedgerResult, StoreError};
pub use id::{AccountId, EntryId};
pub use value_object::{CreditAmount, IdempotencyToken, ValueObject};
