//! Tag-as-deleted tombstone writer.
//!
//! Deleting outright would let an in-flight recompute that started before
//! the source-of-truth update re-install its stale result. The tombstone
//! instead expires the lock into the past and clears the owner: concurrent
//! weak readers keep seeing the old value, the next reader immediately
//! qualifies as the recomputer, and any stale writer fails the owner check.

use crate::cache::Client;
use crate::core::error::{StrataError, StrataResult};
use redis::aio::ConnectionManager;

impl Client {
    /// Logically delete one key; it expires for good after the configured
    /// delay unless a recompute re-installs it first.
    pub async fn tag_as_deleted(&self, key: &str) -> StrataResult<()> {
        if self.options.disable_cache_delete {
            return Ok(());
        }
        tracing::debug!(key, "tagging as deleted");
        let delay = self.options.delay.as_secs() as i64;
        let mut con = self.connection();
        self.scripts
            .delete
            .invoke(&mut con, &[key], &delay)
            .await?;
        if self.options.wait_replicas > 0 {
            self.wait_for_replicas(&mut con).await?;
        }
        Ok(())
    }

    /// Logically delete a batch of keys in one atomic script round.
    pub async fn tag_as_deleted_batch(&self, keys: &[String]) -> StrataResult<()> {
        if self.options.disable_cache_delete {
            return Ok(());
        }
        tracing::debug!(keys = keys.len(), "batch tagging as deleted");
        let delay = self.options.delay.as_secs() as i64;
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut con = self.connection();
        self.scripts
            .delete_batch
            .invoke(&mut con, &key_refs, &delay)
            .await?;
        if self.options.wait_replicas > 0 {
            self.wait_for_replicas(&mut con).await?;
        }
        Ok(())
    }

    /// Block until the configured replica count has acknowledged the
    /// tombstone, bounded by the replica-wait timeout.
    async fn wait_for_replicas(&self, con: &mut ConnectionManager) -> StrataResult<()> {
        let requested = i64::from(self.options.wait_replicas);
        let acknowledged: i64 = redis::cmd("WAIT")
            .arg(requested)
            .arg(self.options.wait_replicas_timeout.as_millis() as u64)
            .query_async(con)
            .await?;
        if acknowledged < requested {
            return Err(StrataError::ReplicaWait {
                requested,
                acknowledged,
            });
        }
        Ok(())
    }
}
