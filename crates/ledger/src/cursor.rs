//! Pagination cursor codec.
//!
//! Wire format: standard (padded) base64 of the decimal string of the last
//! entry id seen. Cursors already handed out to clients depend on this exact
//! encoding.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use moneybox_core::{EntryId, LedgerError, LedgerResult};

/// Encode the id of the last entry on a page.
///
/// `EntryId::NONE` encodes to `"MA=="`, the cursor handed out for empty pages.
pub fn encode_cursor(last_entry_id: EntryId) -> String {
    BASE64.encode(last_entry_id.get().to_string())
}

/// Decode a cursor produced by [`encode_cursor`].
///
/// Fails closed with [`LedgerError::InvalidCursor`]: the token must be padded
/// standard base64 whose payload is a non-empty run of ASCII digits fitting in
/// an `i64`.
pub fn decode_cursor(token: &str) -> LedgerResult<EntryId> {
    let bytes = BASE64
        .decode(token)
        .map_err(|e| LedgerError::invalid_cursor(format!("not valid base64: {e}")))?;

    let payload = core::str::from_utf8(&bytes)
        .map_err(|_| LedgerError::invalid_cursor("payload is not utf-8"))?;

    if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LedgerError::invalid_cursor(format!(
            "payload {payload:?} is not a non-negative integer"
        )));
    }

    let id: i64 = payload
        .parse()
        .map_err(|_| LedgerError::invalid_cursor(format!("entry id {payload} out of range")))?;

    EntryId::new(id).map_err(|e| LedgerError::invalid_cursor(e.to_string()))
}
