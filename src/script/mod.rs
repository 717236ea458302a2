//! Atomic script library and dispatch.
//!
//! Every cross-process state transition is a Lua script executed atomically
//! by the store, parameterized only by KEYS and ARGV. The preferred path
//! evaluates by digest; when the server reports the script is not cached the
//! client loads it and retries, falling back to one inline evaluation if the
//! load itself fails (the server may evict its script cache at any time).
//!
//! - [`library`] - The script sources and the per-client [`ScriptSet`]

pub mod library;

pub use library::ScriptSet;

use crate::core::error::StrataResult;
use redis::aio::ConnectionManager;
use redis::{Cmd, ErrorKind, ToRedisArgs, Value};

/// Sentinel returned by the get scripts when the caller has just acquired
/// the recompute lock. Part of the wire contract.
pub const LOCKED: &str = "LOCKED";

/// One atomic script, addressable by digest with inline fallback.
#[derive(Debug)]
pub struct CacheScript {
    name: &'static str,
    source: &'static str,
    digest: String,
}

impl CacheScript {
    pub(crate) fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            digest: redis::Script::new(source).get_hash().to_string(),
        }
    }

    /// SHA-1 digest the server addresses this script by.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    fn command<A: ToRedisArgs>(&self, by_digest: bool, keys: &[&str], args: &A) -> Cmd {
        let mut cmd = redis::cmd(if by_digest { "EVALSHA" } else { "EVAL" });
        if by_digest {
            cmd.arg(self.digest());
        } else {
            cmd.arg(self.source);
        }
        cmd.arg(keys.len()).arg(keys).arg(args);
        cmd
    }

    /// Evaluate against the given keys and arguments.
    ///
    /// Digest first; on NOSCRIPT load-then-retry; on a failed load, one
    /// inline evaluation.
    pub(crate) async fn invoke<A: ToRedisArgs>(
        &self,
        con: &mut ConnectionManager,
        keys: &[&str],
        args: &A,
    ) -> StrataResult<Value> {
        match self.command(true, keys, args).query_async(con).await {
            Ok(value) => Ok(value),
            Err(err) if err.kind() == ErrorKind::NoScriptError => {
                tracing::debug!(script = self.name, digest = self.digest(), "script not cached, loading");
                let loaded: Result<String, _> = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(self.source)
                    .query_async(con)
                    .await;
                match loaded {
                    Ok(_) => Ok(self.command(true, keys, args).query_async(con).await?),
                    Err(load_err) => {
                        tracing::debug!(script = self.name, error = %load_err, "script load failed, evaluating inline");
                        Ok(self.command(false, keys, args).query_async(con).await?)
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Lock ownership as observed by one get-script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No lock on the key; the value is stable.
    Free,
    /// This caller was just granted the recompute lock.
    Acquired,
    /// Another caller currently owns the lock.
    HeldByOther,
}

/// One key's atomically observed state: the stored value (if any) and who,
/// if anyone, holds the recompute lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// The `value` field, absent when never populated or deleted.
    pub value: Option<String>,
    /// Lock ownership relative to the probing caller.
    pub lock: LockState,
}

impl Probe {
    /// Decode a single `[value, state]` reply from the get script.
    pub fn decode(reply: &Value) -> StrataResult<Self> {
        let (value, state): (Option<String>, Option<String>) = redis::from_redis_value(reply)?;
        Ok(Self {
            value,
            lock: lock_state(state),
        })
    }

    /// Decode the get-batch reply: one `[value, state]` pair per key, in
    /// input order.
    pub fn decode_many(reply: &Value) -> StrataResult<Vec<Self>> {
        let pairs: Vec<(Option<String>, Option<String>)> = redis::from_redis_value(reply)?;
        Ok(pairs
            .into_iter()
            .map(|(value, state)| Self {
                value,
                lock: lock_state(state),
            })
            .collect())
    }
}

fn lock_state(state: Option<String>) -> LockState {
    match state.as_deref() {
        None => LockState::Free,
        Some(LOCKED) => LockState::Acquired,
        Some(_) => LockState::HeldByOther,
    }
}
