//! Lock clock and owner identity.
//!
//! Lock deadlines are absolute epoch seconds compared inside the store's
//! scripts, so every process that talks to the same store shares the same
//! clock discipline. Owner tokens prove authorship of a recompute: a writer
//! whose token no longer matches the stored one is discarded.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall-clock time in whole epoch seconds.
///
/// Scripts compare lock deadlines at second granularity; sub-second
/// precision never crosses the wire.
pub fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Mint a fresh owner token for one read attempt.
///
/// Tokens only need to be unique among concurrent recomputes of the same
/// key over the store's lifetime; a random UUID is far beyond that.
pub fn owner_token() -> String {
    Uuid::new_v4().simple().to_string()
}
