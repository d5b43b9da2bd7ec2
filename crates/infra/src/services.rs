//! Service wiring: store selection plus engine/paginator construction.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use moneybox_ledger::{HistoryPaginator, LedgerEngine, LedgerStore};

use crate::config::LedgerConfig;
use crate::ledger_store::{InMemoryLedgerStore, PostgresLedgerStore};

/// Store handle shared by every service.
pub type SharedStore = Arc<dyn LedgerStore>;

/// What request-handling code calls into.
#[derive(Clone)]
pub struct LedgerServices<S> {
    pub engine: LedgerEngine<S>,
    pub history: HistoryPaginator<S>,
}

impl<S> LedgerServices<S>
where
    S: LedgerStore + Clone,
{
    /// Engine and paginator over one store, tuned by `config`.
    pub fn new(store: S, config: &LedgerConfig) -> Self {
        let mut engine = LedgerEngine::new(store.clone());
        if let Some(deadline) = config.credit_deadline {
            engine = engine.with_deadline(deadline);
        }
        let history = HistoryPaginator::new(store).with_max_page_size(config.max_page_size);
        Self { engine, history }
    }
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(config: &LedgerConfig) -> anyhow::Result<LedgerServices<SharedStore>> {
    let store: SharedStore = match config.database_url {
        Some(_) => {
            let pool = config.connect().await.context("connecting ledger store")?;
            let mut store = PostgresLedgerStore::new(pool);
            if let Some(deadline) = config.credit_deadline {
                store = store.with_lock_timeout(deadline);
            }
            store
                .install_schema()
                .await
                .context("installing ledger schema")?;
            info!("using Postgres ledger store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory ledger store");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    Ok(LedgerServices::new(store, config))
}
