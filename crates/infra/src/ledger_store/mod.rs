//! Ledger store adapters.
//!
//! Both adapters implement the ports from `moneybox_ledger::store` with the
//! same observable semantics; the in-memory one exists for tests/dev.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PostgresLedgerStore, PostgresUnitOfWork, SCHEMA};
