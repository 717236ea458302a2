//! Client configuration and validation.
//!
//! Options are frozen at client construction. The struct derives serde so an
//! application can embed it in its own configuration file; durations are
//! (de)serialized as integer milliseconds.

use crate::core::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client options.
///
/// `delay` and `lock_expire` must be non-zero; [`Options::validate`] is run
/// by `Client::new` and fails fast otherwise. Start from [`Options::default`]
/// and override what you need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Tombstone TTL after tag-as-deleted. Also subtracted from every
    /// effective TTL to create a grace window for delayed deletes.
    #[serde(with = "duration_ms", rename = "delay_ms")]
    pub delay: Duration,

    /// TTL used when the fetch function returns an empty result. Zero
    /// disables negative caching: the key is deleted instead.
    #[serde(with = "duration_ms", rename = "empty_expire_ms")]
    pub empty_expire: Duration,

    /// How long a granted recompute lock remains valid. Should cover the
    /// worst-case latency of the underlying data source.
    #[serde(with = "duration_ms", rename = "lock_expire_ms")]
    pub lock_expire: Duration,

    /// Wait interval between probes while another owner holds the lock.
    #[serde(with = "duration_ms", rename = "lock_sleep_ms")]
    pub lock_sleep: Duration,

    /// If > 0, tombstone writes wait for this many replicas to acknowledge.
    pub wait_replicas: u32,

    /// Deadline for the replica wait.
    #[serde(with = "duration_ms", rename = "wait_replicas_timeout_ms")]
    pub wait_replicas_timeout: Duration,

    /// Fraction in [0, 1) of the expire time used as the jitter range that
    /// desynchronizes mass expiry of keys written together.
    pub random_expire_adjustment: f64,

    /// Bypass the cache entirely: fetch calls go straight to the fetch
    /// function. Degradation switch for when the store is down.
    pub disable_cache_read: bool,

    /// Turn tag-as-deleted into a no-op. Degradation switch for when the
    /// store is down.
    pub disable_cache_delete: bool,

    /// Select the strong read state machine: never serve a value while a
    /// recompute is in flight.
    pub strong_consistency: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            empty_expire: Duration::from_secs(60),
            lock_expire: Duration::from_secs(3),
            lock_sleep: Duration::from_millis(100),
            wait_replicas: 0,
            wait_replicas_timeout: Duration::from_millis(3000),
            random_expire_adjustment: 0.1,
            disable_cache_read: false,
            disable_cache_delete: false,
            strong_consistency: false,
        }
    }
}

impl Options {
    /// Validate option consistency.
    pub fn validate(&self) -> StrataResult<()> {
        if self.delay.is_zero() || self.lock_expire.is_zero() {
            return Err(StrataError::Config(
                "delay and lock_expire must not be zero, start from Options::default()"
                    .to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.random_expire_adjustment) {
            return Err(StrataError::Config(format!(
                "random_expire_adjustment must be in [0, 1), got: {}",
                self.random_expire_adjustment
            )));
        }
        Ok(())
    }

    /// Effective TTL for a freshly computed value: the requested expire
    /// minus the tombstone grace window minus a random slice of the jitter
    /// range. Saturates at zero for expire times shorter than the window.
    pub(crate) fn effective_expire(&self, expire: Duration) -> Duration {
        let jitter = rand::random::<f64>() * self.random_expire_adjustment * expire.as_secs_f64();
        expire
            .saturating_sub(self.delay)
            .saturating_sub(Duration::from_secs_f64(jitter))
    }

    /// Wait interval with the zero-value clamped, so misconfigured waiters
    /// degrade to a tight poll instead of a busy loop.
    pub(crate) fn wait_interval(&self) -> Duration {
        self.lock_sleep.max(Duration::from_millis(1))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
