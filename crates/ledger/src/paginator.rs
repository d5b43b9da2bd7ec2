//! Keyset pagination over an account's ledger entries.
//!
//! Pages are ordered by entry id, newest first, and each page continues strictly
//! below the last id of the previous one. Ids are never reused and new entries
//! always get higher ids than any cursor already issued, so concurrent inserts
//! never shift page boundaries.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use moneybox_core::{AccountId, EntryId, LedgerError, LedgerResult};

use crate::cursor::{decode_cursor, encode_cursor};
use crate::entry::LedgerEntry;
use crate::store::LedgerStore;

/// Largest page served unless configured otherwise.
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

/// One page of an account's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Newest first.
    pub entries: Vec<LedgerEntry>,
    /// Entry count of the whole account, not just this page.
    pub total: u64,
    /// Limit actually applied to this page (after clamping).
    pub page_size: u32,
    /// Cursor for the following (older) page; `"MA=="` when this page is empty.
    pub next_cursor: String,
}

#[derive(Debug, Clone)]
pub struct HistoryPaginator<S> {
    store: S,
    max_page_size: u32,
}

impl<S> HistoryPaginator<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Override the page size clamp (at least 1).
    pub fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    pub fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    /// Zero is rejected; anything above the configured maximum is clamped.
    pub fn effective_page_size(&self, requested: u32) -> LedgerResult<u32> {
        if requested == 0 {
            return Err(LedgerError::validation("page size must be positive"));
        }
        Ok(requested.min(self.max_page_size))
    }

    /// List `account_id`'s entries, starting after `cursor` (or at the newest
    /// entry when `cursor` is absent or empty).
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn list_history(
        &self,
        account_id: &AccountId,
        page_size: u32,
        cursor: Option<&str>,
    ) -> LedgerResult<HistoryPage> {
        let before = match cursor {
            Some(token) if !token.is_empty() => Some(
                decode_cursor(token).inspect_err(|err| debug!(error = %err, "cursor rejected"))?,
            ),
            _ => None,
        };
        let limit = self.effective_page_size(page_size)?;

        let entries = self
            .store
            .list_entries(account_id, before, limit)
            .await
            .inspect_err(|err| error!(error = %err, "listing entries failed"))?;
        let total = self
            .store
            .count_entries(account_id)
            .await
            .inspect_err(|err| error!(error = %err, "counting entries failed"))?;

        let last_id = entries.last().map(|e| e.id).unwrap_or(EntryId::NONE);
        debug!(returned = entries.len(), total, %last_id, "history page fetched");

        Ok(HistoryPage {
            entries,
            total,
            page_size: limit,
            next_cursor: encode_cursor(last_id),
        })
    }
}
