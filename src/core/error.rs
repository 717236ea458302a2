//! Error types.
//!
//! Strata defines one error enum covering the store, the user-supplied fetch
//! function, and the coordination protocol itself. The enum is `Clone` so a
//! single-flight leader can hand the same failure to every coalesced caller;
//! non-cloneable sources are shared through `Arc`.

use std::sync::Arc;
use thiserror::Error;

/// Error type produced by a user-supplied fetch function.
pub type FetchError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience result alias for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

/// Common strata error conditions.
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    /// Failure reported by the key-value store.
    #[error("store error: {0}")]
    Store(Arc<redis::RedisError>),

    /// The user-supplied fetch function returned an error.
    ///
    /// The owned recompute lock was released before this surfaced, so the
    /// key becomes eligible for retry immediately.
    #[error("fetch function failed: {0}")]
    Fetch(Arc<FetchError>),

    /// The user-supplied fetch function panicked.
    ///
    /// The panic was caught at the recompute boundary and the owned lock
    /// released; the payload is logged, not carried here.
    #[error("fetch function panicked")]
    FetchPanicked,

    /// The caller's cancellation token fired during a wait loop.
    #[error("operation cancelled")]
    Cancelled,

    /// A tombstone write reached fewer replicas than required.
    #[error("wait replicas {requested} failed. result replicas: {acknowledged}")]
    ReplicaWait {
        /// Replica count the tombstone was configured to wait for.
        requested: i64,
        /// Replica count the store actually acknowledged in time.
        acknowledged: i64,
    },

    /// `lock_for_update` found the key held by another owner.
    #[error("{key} has been locked by {owner}")]
    LockContended {
        /// The contended cache key.
        key: String,
        /// Owner token currently holding the lock.
        owner: String,
    },

    /// Invalid options at client construction.
    #[error("cache options error: {0}")]
    Config(String),

    /// Typed-value encode or decode failure.
    #[error("codec error: {0}")]
    Codec(Arc<serde_json::Error>),
}

impl StrataError {
    /// Wrap a fetch-function error.
    pub fn fetch(err: FetchError) -> Self {
        Self::Fetch(Arc::new(err))
    }
}

impl From<redis::RedisError> for StrataError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(Arc::new(err))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_wait_names_both_counts() {
        let err = StrataError::ReplicaWait {
            requested: 2,
            acknowledged: 1,
        };
        assert_eq!(
            err.to_string(),
            "wait replicas 2 failed. result replicas: 1"
        );
    }

    #[test]
    fn lock_contended_names_the_holder() {
        let err = StrataError::LockContended {
            key: "user:42".to_string(),
            owner: "owner-a".to_string(),
        };
        assert_eq!(err.to_string(), "user:42 has been locked by owner-a");
    }

    #[test]
    fn fetch_error_is_cloneable_and_keeps_the_message() {
        let err = StrataError::fetch("db offline".into());
        let clone = err.clone();
        assert_eq!(clone.to_string(), "fetch function failed: db offline");
    }
}
