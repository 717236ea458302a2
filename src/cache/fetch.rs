//! Single-key fetch engine.
//!
//! One read is one fresh owner token driving a small state machine over the
//! get script. Weak mode returns any consistent value as soon as it has one,
//! serving a tombstoned value immediately while a detached refresh runs;
//! strong mode also waits out foreign locks when a stale value is present,
//! so it never returns a value older than the most recent recompute.

use crate::cache::Client;
use crate::core::error::{FetchError, StrataError, StrataResult};
use crate::core::time::owner_token;
use crate::script::LockState;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl Client {
    /// Return the value cached at `key`, recomputing it through `fetch_fn`
    /// when missing or expired.
    ///
    /// An empty string from `fetch_fn` records a negative result (or
    /// deletes the key when negative caching is disabled). The installed
    /// TTL is `expire` minus the delete-delay grace window minus a random
    /// jitter slice.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        self.fetch_with(&CancellationToken::new(), key, expire, fetch_fn)
            .await
    }

    /// Like [`fetch`](Self::fetch), bounded by a caller-owned cancellation
    /// token. A fired token surfaces [`StrataError::Cancelled`] within one
    /// lock-sleep interval instead of waiting out a foreign lock.
    pub async fn fetch_with<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        let effective = self.options.effective_expire(expire);
        let client = self.clone();
        let cancel = cancel.clone();
        let key_owned = key.to_string();
        self.group
            .run(key, move || async move {
                if client.options.disable_cache_read {
                    fetch_fn().await.map_err(StrataError::fetch)
                } else if client.options.strong_consistency {
                    client
                        .strong_fetch(&cancel, &key_owned, effective, fetch_fn)
                        .await
                } else {
                    client
                        .weak_fetch(&cancel, &key_owned, effective, fetch_fn)
                        .await
                }
            })
            .await
    }

    async fn weak_fetch<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        let owner = owner_token();
        loop {
            let probe = self.probe(key, &owner).await?;
            match probe.lock {
                LockState::HeldByOther if probe.value.is_none() => {
                    tracing::debug!(key, "empty and locked by another owner, waiting");
                    self.wait_turn(cancel).await?;
                }
                LockState::Acquired => {
                    return match probe.value {
                        None => self.recompute(key, expire, &owner, fetch_fn).await,
                        Some(stale) => {
                            // Expired lock left a stale value behind: serve
                            // it now, refresh behind the caller's back.
                            self.spawn_refresh(key, expire, owner, fetch_fn);
                            Ok(stale)
                        }
                    };
                }
                _ => return Ok(probe.value.unwrap_or_default()),
            }
        }
    }

    async fn strong_fetch<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        let owner = owner_token();
        loop {
            let probe = self.probe(key, &owner).await?;
            match probe.lock {
                LockState::HeldByOther => {
                    tracing::debug!(key, "locked by another owner, waiting");
                    self.wait_turn(cancel).await?;
                }
                LockState::Acquired => return self.recompute(key, expire, &owner, fetch_fn).await,
                LockState::Free => return Ok(probe.value.unwrap_or_default()),
            }
        }
    }

    /// Run the fetch function while holding the recompute lock, then commit
    /// the value or clean up.
    ///
    /// On an error or a caught panic the lock is released first, so the key
    /// is immediately eligible for retry instead of waiting out the lock
    /// expiry.
    pub(crate) async fn recompute<F, Fut>(
        &self,
        key: &str,
        expire: Duration,
        owner: &str,
        fetch_fn: F,
    ) -> StrataResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        let value = match AssertUnwindSafe(fetch_fn()).catch_unwind().await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                let _ = self.unlock(key, owner).await;
                return Err(StrataError::fetch(err));
            }
            Err(payload) => {
                tracing::warn!(
                    key,
                    panic = panic_message(payload.as_ref()),
                    "fetch function panicked"
                );
                let _ = self.unlock(key, owner).await;
                return Err(StrataError::FetchPanicked);
            }
        };

        let mut expire = expire;
        if value.is_empty() {
            if self.options.empty_expire.is_zero() {
                self.discard(key).await?;
                return Ok(value);
            }
            expire = self.options.empty_expire;
        }
        self.install(key, &value, expire.as_secs() as i64, owner)
            .await?;
        Ok(value)
    }

    /// Detach a refresh for a stale value the caller is about to receive.
    pub(crate) fn spawn_refresh<F, Fut>(
        &self,
        key: &str,
        expire: Duration,
        owner: String,
        fetch_fn: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, FetchError>> + Send + 'static,
    {
        let client = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tracing::debug!(key = %key, "background refresh");
            if let Err(error) = client.recompute(&key, expire, &owner, fetch_fn).await {
                tracing::debug!(key = %key, %error, "background refresh failed");
            }
        });
    }

    /// One cancellable wait interval, armed after the probe that decided to
    /// wait so round-trip time never shortens the cadence.
    pub(crate) async fn wait_turn(&self, cancel: &CancellationToken) -> StrataResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StrataError::Cancelled),
            _ = tokio::time::sleep(self.options.wait_interval()) => Ok(()),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
