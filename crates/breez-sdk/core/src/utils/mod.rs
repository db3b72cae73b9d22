pub(crate) mod deposit_chain_syncer;
pub(crate) mod utxo_fetcher;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
