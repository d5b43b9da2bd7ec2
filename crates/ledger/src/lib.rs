//! `moneybox-ledger`: credit protocol and transaction history.
//!
//! - [`LedgerEngine`] applies idempotent credits inside one unit of work.
//! - [`HistoryPaginator`] serves an account's entries through opaque cursors.
//!
//! Both talk to persistence only through the ports in [`store`].

pub mod account;
pub mod cursor;
pub mod engine;
pub mod entry;
pub mod paginator;
pub mod store;

pub use account::Account;
pub use cursor::{decode_cursor, encode_cursor};
pub use engine::LedgerEngine;
pub use entry::{LedgerEntry, NewLedgerEntry};
pub use paginator::{DEFAULT_MAX_PAGE_SIZE, HistoryPage, HistoryPaginator};
pub use store::{LedgerStore, UnitOfWork};
