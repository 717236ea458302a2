//! Batch fetch engine.
//!
//! The single-key protocol generalized to N keys: one atomic get-batch
//! probe partitions the indices, foreground and background fetches run over
//! the owned subsets, and a concurrent waiter polls each key held by a
//! foreign owner. The result map always carries exactly one entry per input
//! index.

use crate::cache::Client;
use crate::core::error::{FetchError, StrataError, StrataResult};
use crate::core::time::owner_token;
use crate::script::{LockState, Probe};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where each index goes after the initial probe round.
#[derive(Debug, Default, PartialEq, Eq)]
struct Partition {
    /// Values returned as-is.
    ready: Vec<(usize, String)>,
    /// Held by a foreign owner; a waiter polls each of these.
    to_wait: Vec<usize>,
    /// Locks we own with no value; fetched in the foreground.
    to_fetch: Vec<usize>,
    /// Locks we own over a stale value; served stale, refreshed behind the
    /// caller's back. Weak mode only.
    to_fetch_async: Vec<(usize, String)>,
}

fn partition_weak(probes: Vec<Probe>) -> Partition {
    let mut partition = Partition::default();
    for (idx, probe) in probes.into_iter().enumerate() {
        match (probe.value, probe.lock) {
            (None, LockState::Acquired) => partition.to_fetch.push(idx),
            (None, _) => partition.to_wait.push(idx),
            (Some(stale), LockState::Acquired) => partition.to_fetch_async.push((idx, stale)),
            (Some(value), _) => partition.ready.push((idx, value)),
        }
    }
    partition
}

fn partition_strong(probes: Vec<Probe>) -> Partition {
    let mut partition = Partition::default();
    for (idx, probe) in probes.into_iter().enumerate() {
        match probe.lock {
            LockState::Free => partition
                .ready
                .push((idx, probe.value.unwrap_or_default())),
            LockState::Acquired => partition.to_fetch.push(idx),
            LockState::HeldByOther => partition.to_wait.push(idx),
        }
    }
    partition
}

/// How one waiter resolved its key.
enum WaiterOutcome {
    /// A settled value became visible.
    Value(String),
    /// The waiter was granted the lock over an empty key.
    NeedFetch,
    /// The waiter was granted the lock over a stale value.
    NeedAsyncFetch(String),
}

impl Client {
    /// Batch [`fetch`](Self::fetch): one result-map entry per input index.
    ///
    /// `fetch_fn` receives the indices missing from the cache and returns a
    /// map of index to value; indices it leaves out are treated as empty
    /// results.
    pub async fn fetch_batch<F, Fut>(
        &self,
        keys: &[String],
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<HashMap<usize, String>>
    where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        self.fetch_batch_with(&CancellationToken::new(), keys, expire, fetch_fn)
            .await
    }

    /// Like [`fetch_batch`](Self::fetch_batch), bounded by a caller-owned
    /// cancellation token.
    pub async fn fetch_batch_with<F, Fut>(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<HashMap<usize, String>>
    where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        let fetch_fn = Arc::new(fetch_fn);
        if self.options.disable_cache_read {
            let idxs: Vec<usize> = (0..keys.len()).collect();
            return (*fetch_fn)(idxs).await.map_err(StrataError::fetch);
        }
        if self.options.strong_consistency {
            self.strong_fetch_batch(cancel, keys, expire, fetch_fn).await
        } else {
            self.weak_fetch_batch(cancel, keys, expire, fetch_fn).await
        }
    }

    async fn weak_fetch_batch<F, Fut>(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
        expire: Duration,
        fetch_fn: Arc<F>,
    ) -> StrataResult<HashMap<usize, String>>
    where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        tracing::debug!(keys = keys.len(), "weak batch fetch");
        let owner = owner_token();
        let probes = self.probe_batch(keys, &owner).await?;
        let Partition {
            ready,
            to_wait,
            to_fetch,
            to_fetch_async,
        } = partition_weak(probes);

        let mut result: HashMap<usize, String> = ready.into_iter().collect();

        if !to_fetch_async.is_empty() {
            let mut idxs = Vec::with_capacity(to_fetch_async.len());
            for (idx, stale) in to_fetch_async {
                result.insert(idx, stale);
                idxs.push(idx);
            }
            self.spawn_batch_refresh(keys.to_vec(), idxs, expire, owner.clone(), fetch_fn.clone());
        }

        if !to_fetch.is_empty() {
            let fetched = self
                .fetch_batch_inner(keys, &to_fetch, expire, &owner, &fetch_fn)
                .await?;
            for idx in to_fetch {
                result.insert(idx, fetched.get(&idx).cloned().unwrap_or_default());
            }
        }

        if !to_wait.is_empty() {
            let waiters = to_wait.iter().map(|&idx| {
                let key = &keys[idx];
                let owner = &owner;
                async move { (idx, self.wait_weak(cancel, key, owner).await) }
            });
            let outcomes = join_all(waiters).await;

            let mut to_fetch = Vec::new();
            let mut to_fetch_async = Vec::new();
            for (idx, outcome) in outcomes {
                match outcome? {
                    WaiterOutcome::Value(value) => {
                        result.insert(idx, value);
                    }
                    WaiterOutcome::NeedFetch => to_fetch.push(idx),
                    WaiterOutcome::NeedAsyncFetch(stale) => {
                        result.insert(idx, stale);
                        to_fetch_async.push(idx);
                    }
                }
            }

            if !to_fetch_async.is_empty() {
                self.spawn_batch_refresh(
                    keys.to_vec(),
                    to_fetch_async,
                    expire,
                    owner.clone(),
                    fetch_fn.clone(),
                );
            }
            if !to_fetch.is_empty() {
                let fetched = self
                    .fetch_batch_inner(keys, &to_fetch, expire, &owner, &fetch_fn)
                    .await?;
                for idx in to_fetch {
                    result.insert(idx, fetched.get(&idx).cloned().unwrap_or_default());
                }
            }
        }

        Ok(result)
    }

    async fn strong_fetch_batch<F, Fut>(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
        expire: Duration,
        fetch_fn: Arc<F>,
    ) -> StrataResult<HashMap<usize, String>>
    where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        tracing::debug!(keys = keys.len(), "strong batch fetch");
        let owner = owner_token();
        let probes = self.probe_batch(keys, &owner).await?;
        let Partition {
            ready,
            to_wait,
            to_fetch,
            ..
        } = partition_strong(probes);

        let mut result: HashMap<usize, String> = ready.into_iter().collect();

        if !to_fetch.is_empty() {
            let fetched = self
                .fetch_batch_inner(keys, &to_fetch, expire, &owner, &fetch_fn)
                .await?;
            for idx in to_fetch {
                result.insert(idx, fetched.get(&idx).cloned().unwrap_or_default());
            }
        }

        if !to_wait.is_empty() {
            let waiters = to_wait.iter().map(|&idx| {
                let key = &keys[idx];
                let owner = &owner;
                async move { (idx, self.wait_strong(cancel, key, owner).await) }
            });
            let outcomes = join_all(waiters).await;

            let mut to_fetch = Vec::new();
            for (idx, outcome) in outcomes {
                match outcome? {
                    WaiterOutcome::Value(value) => {
                        result.insert(idx, value);
                    }
                    WaiterOutcome::NeedFetch | WaiterOutcome::NeedAsyncFetch(_) => {
                        to_fetch.push(idx);
                    }
                }
            }
            if !to_fetch.is_empty() {
                let fetched = self
                    .fetch_batch_inner(keys, &to_fetch, expire, &owner, &fetch_fn)
                    .await?;
                for idx in to_fetch {
                    result.insert(idx, fetched.get(&idx).cloned().unwrap_or_default());
                }
            }
        }

        Ok(result)
    }

    /// Poll one foreign-held key on the wait cadence, weak rules: exit as
    /// soon as any value is visible or we are granted the lock.
    async fn wait_weak(
        &self,
        cancel: &CancellationToken,
        key: &str,
        owner: &str,
    ) -> StrataResult<WaiterOutcome> {
        loop {
            let probe = self.probe(key, owner).await?;
            match (probe.value, probe.lock) {
                (None, LockState::HeldByOther) => {
                    tracing::debug!(key, "batch waiter: still locked, sleeping");
                    self.wait_turn(cancel).await?;
                }
                (None, _) => return Ok(WaiterOutcome::NeedFetch),
                (Some(stale), LockState::Acquired) => {
                    return Ok(WaiterOutcome::NeedAsyncFetch(stale))
                }
                (Some(value), _) => return Ok(WaiterOutcome::Value(value)),
            }
        }
    }

    /// Poll one foreign-held key on the wait cadence, strong rules: exit
    /// only once the lock is gone or ours.
    async fn wait_strong(
        &self,
        cancel: &CancellationToken,
        key: &str,
        owner: &str,
    ) -> StrataResult<WaiterOutcome> {
        loop {
            let probe = self.probe(key, owner).await?;
            match probe.lock {
                LockState::HeldByOther => {
                    tracing::debug!(key, "batch waiter: still locked, sleeping");
                    self.wait_turn(cancel).await?;
                }
                LockState::Acquired => return Ok(WaiterOutcome::NeedFetch),
                LockState::Free => {
                    return Ok(WaiterOutcome::Value(probe.value.unwrap_or_default()))
                }
            }
        }
    }

    /// Fetch the owned subset in one fn call and commit the results.
    ///
    /// A failing or panicking fn releases every lock in the subset and
    /// aborts the batch; there is no partial success for this owner.
    async fn fetch_batch_inner<F, Fut>(
        &self,
        keys: &[String],
        idxs: &[usize],
        expire: Duration,
        owner: &str,
        fetch_fn: &Arc<F>,
    ) -> StrataResult<HashMap<usize, String>>
    where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        let mut data = match AssertUnwindSafe((**fetch_fn)(idxs.to_vec()))
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => data,
            Ok(Err(err)) => {
                self.unlock_all(keys, idxs, owner).await;
                return Err(StrataError::fetch(err));
            }
            Err(payload) => {
                tracing::warn!(
                    panic = super::fetch::panic_message(payload.as_ref()),
                    "batch fetch function panicked"
                );
                self.unlock_all(keys, idxs, owner).await;
                return Err(StrataError::FetchPanicked);
            }
        };

        let mut batch_keys: Vec<&str> = Vec::new();
        let mut batch_values: Vec<String> = Vec::new();
        let mut batch_expires: Vec<i64> = Vec::new();

        for &idx in idxs {
            let value = data.get(&idx).cloned().unwrap_or_default();
            let mut effective = self.options.effective_expire(expire);
            if value.is_empty() {
                // Indices the fn left out read back as recorded empties.
                data.insert(idx, String::new());
                if self.options.empty_expire.is_zero() {
                    if let Err(error) = self.discard(&keys[idx]).await {
                        tracing::debug!(key = %keys[idx], %error, "delete of empty result failed");
                    }
                    continue;
                }
                effective = self.options.empty_expire;
            }
            batch_keys.push(&keys[idx]);
            batch_values.push(value);
            batch_expires.push(effective.as_secs() as i64);
        }

        if !batch_keys.is_empty() {
            if let Err(error) = self
                .install_batch(&batch_keys, &batch_values, &batch_expires, owner)
                .await
            {
                tracing::debug!(%error, "batch install failed");
            }
        }
        Ok(data)
    }

    async fn unlock_all(&self, keys: &[String], idxs: &[usize], owner: &str) {
        for &idx in idxs {
            if let Err(error) = self.unlock(&keys[idx], owner).await {
                tracing::debug!(key = %keys[idx], %error, "unlock after failed batch fetch failed");
            }
        }
    }

    /// Detach a refresh for stale values the caller is about to receive.
    fn spawn_batch_refresh<F, Fut>(
        &self,
        keys: Vec<String>,
        idxs: Vec<usize>,
        expire: Duration,
        owner: String,
        fetch_fn: Arc<F>,
    ) where
        F: Fn(Vec<usize>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<usize, String>, FetchError>> + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            tracing::debug!(count = idxs.len(), "background batch refresh");
            if let Err(error) = client
                .fetch_batch_inner(&keys, &idxs, expire, &owner, &fetch_fn)
                .await
            {
                tracing::debug!(%error, "background batch refresh failed");
            }
        });
    }
}
