//! Infrastructure layer: ledger stores, configuration, service wiring.

pub mod config;
pub mod ledger_store;
pub mod services;

mod integration_tests;

pub use config::{ConfigError, LedgerConfig};
pub use ledger_store::{InMemoryLedgerStore, PostgresLedgerStore};
pub use services::{LedgerServices, SharedStore, build_services};
