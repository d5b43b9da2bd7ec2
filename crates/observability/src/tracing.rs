//! Tracing/logging initialization.
//!
//! JSON lines with timestamps, filtered by `RUST_LOG`. Ledger spans carry
//! `account_id` and `idempotency_token`, so a credit can be followed end to end.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber, using `default_directive` when `RUST_LOG` is
/// unset or unparsable.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
