//! Client surface and fetch engines.
//!
//! This module contains the public cache client and the machinery behind it:
//! the weak/strong single-key state machines (`fetch`), the batch engine
//! (`batch`), the tag-as-deleted tombstone writer (`tombstone`) and the
//! in-process single-flight table (`singleflight`). Raw field access and
//! application-driven lock escalation live on the client itself.

mod batch;
mod fetch;
mod singleflight;
mod tombstone;

use crate::cache::singleflight::Group;
use crate::core::error::{StrataError, StrataResult};
use crate::core::options::Options;
use crate::core::time::epoch_seconds;
use crate::script::{Probe, ScriptSet, LOCKED};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Deadline used by `lock_for_update`: far enough in the future that an
/// escalated lock never expires on its own (10^10 epoch seconds).
const ESCALATION_DEADLINE: i64 = 10_000_000_000;

/// Consistent cache client over one Redis-compatible store.
///
/// Cheap to clone: clones share the connection manager, the frozen options,
/// the digested script set and the in-process single-flight table.
#[derive(Clone)]
pub struct Client {
    pub(crate) con: ConnectionManager,
    pub(crate) options: Arc<Options>,
    pub(crate) scripts: Arc<ScriptSet>,
    pub(crate) group: Arc<Group>,
}

impl Client {
    /// Create a client over an established connection manager.
    ///
    /// Fails fast on invalid options; `delay` and `lock_expire` must be
    /// non-zero for the delayed-delete protocol to work at all.
    pub fn new(con: ConnectionManager, options: Options) -> StrataResult<Self> {
        options.validate()?;
        Ok(Self {
            con,
            options: Arc::new(options),
            scripts: Arc::new(ScriptSet::new()),
            group: Arc::new(Group::new()),
        })
    }

    /// The options this client was constructed with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.con.clone()
    }

    // ------------------------------------------------------------------
    // Script wrappers
    // ------------------------------------------------------------------

    /// Probe one key, acquiring the recompute lock when eligible.
    pub(crate) async fn probe(&self, key: &str, owner: &str) -> StrataResult<Probe> {
        let now = epoch_seconds();
        let lock_until = now + self.options.lock_expire.as_secs() as i64;
        let mut con = self.connection();
        let reply = self
            .scripts
            .get
            .invoke(&mut con, &[key], &(now, lock_until, owner))
            .await?;
        Probe::decode(&reply)
    }

    /// Probe N keys in one atomic round, acquiring eligible locks.
    pub(crate) async fn probe_batch(&self, keys: &[String], owner: &str) -> StrataResult<Vec<Probe>> {
        let now = epoch_seconds();
        let lock_until = now + self.options.lock_expire.as_secs() as i64;
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut con = self.connection();
        let reply = self
            .scripts
            .get_batch
            .invoke(&mut con, &key_refs, &(now, lock_until, owner))
            .await?;
        Probe::decode_many(&reply)
    }

    /// Install a freshly computed value under our owner token.
    pub(crate) async fn install(
        &self,
        key: &str,
        value: &str,
        expire_secs: i64,
        owner: &str,
    ) -> StrataResult<()> {
        let mut con = self.connection();
        self.scripts
            .set
            .invoke(&mut con, &[key], &(value, owner, expire_secs))
            .await?;
        Ok(())
    }

    /// Install a batch of values under our owner token.
    pub(crate) async fn install_batch(
        &self,
        keys: &[&str],
        values: &[String],
        expires: &[i64],
        owner: &str,
    ) -> StrataResult<()> {
        let mut args: Vec<String> = Vec::with_capacity(1 + values.len() + expires.len());
        args.push(owner.to_string());
        args.extend(values.iter().cloned());
        args.extend(expires.iter().map(|e| e.to_string()));
        let mut con = self.connection();
        self.scripts.set_batch.invoke(&mut con, keys, &args).await?;
        Ok(())
    }

    /// Release a lock we own, leaving the key eligible for the next reader.
    pub(crate) async fn unlock(&self, key: &str, owner: &str) -> StrataResult<()> {
        let ttl = self.options.lock_expire.as_secs() as i64;
        let mut con = self.connection();
        self.scripts
            .unlock
            .invoke(&mut con, &[key], &(owner, ttl))
            .await?;
        Ok(())
    }

    /// Drop the key outright; used for empty results with negative caching
    /// disabled. Unconditional, no ownership check.
    pub(crate) async fn discard(&self, key: &str) -> StrataResult<()> {
        let mut con = self.connection();
        let _: () = con.del(key).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw access and lock escalation
    // ------------------------------------------------------------------

    /// Read the raw `value` field, bypassing lock logic entirely. Meant for
    /// debugging and out-of-band readers.
    pub async fn raw_get(&self, key: &str) -> StrataResult<Option<String>> {
        let mut con = self.connection();
        Ok(con.hget(key, "value").await?)
    }

    /// Write the raw `value` field and reset the hash TTL, no lock
    /// semantics.
    pub async fn raw_set(&self, key: &str, value: &str, expire: Duration) -> StrataResult<()> {
        let mut con = self.connection();
        let _: () = con.hset(key, "value", value).await?;
        let _: () = con.expire(key, expire.as_secs() as i64).await?;
        Ok(())
    }

    /// Take an exclusive long-held lock on `key` for an application-driven
    /// update, typically spanning a database transaction. Re-entrant for
    /// the same owner; any other holder yields [`StrataError::LockContended`]
    /// naming them.
    pub async fn lock_for_update(&self, key: &str, owner: &str) -> StrataResult<()> {
        let mut con = self.connection();
        let reply = self
            .scripts
            .lock
            .invoke(&mut con, &[key], &(owner, ESCALATION_DEADLINE))
            .await?;
        let holder: Option<String> = redis::from_redis_value(&reply)?;
        match holder {
            Some(current) if current == LOCKED => Ok(()),
            current => Err(StrataError::LockContended {
                key: key.to_string(),
                owner: current.unwrap_or_default(),
            }),
        }
    }

    /// Release a lock taken with [`lock_for_update`](Self::lock_for_update).
    pub async fn unlock_for_update(&self, key: &str, owner: &str) -> StrataResult<()> {
        self.unlock(key, owner).await
    }
}
