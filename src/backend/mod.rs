//! Backing-store adapters for the tagging layer.
//!
//! The tagging layer talks to its store through the [`TagStore`] trait, a
//! narrow slice of the Redis command set. This module ships with:
//! - [`memory::InMemoryStore`], a process-local store for tests and
//!   single-process deployments.
//! - `redis::RedisStore` *(optional)*, a Redis connection when the
//!   `redis-backend` crate feature is enabled.
//!
//! Stores apply their own key prefix to every key argument. Set members are
//! stored verbatim, which is why the reference index records fully-qualified
//! keys and strips the prefix again when reading them back.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::CacheError;

/// Expiration modifier attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Expire after the given number of seconds (`EX`).
    Seconds(u64),
    /// Expire after the given number of milliseconds (`PX`).
    Millis(u64),
}

impl Expiry {
    pub fn as_millis(&self) -> u64 {
        match self {
            Expiry::Seconds(secs) => secs.saturating_mul(1000),
            Expiry::Millis(ms) => *ms,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }

    /// Rejects a zero lifetime, which Redis refuses for `SET .. EX/PX`.
    pub fn validate(expiry: Option<Expiry>) -> Result<Option<Expiry>, CacheError> {
        match expiry {
            Some(expiry) if expiry.as_millis() == 0 => Err(CacheError::InvalidConfig(
                "expiry must be greater than zero".to_owned(),
            )),
            expiry => Ok(expiry),
        }
    }
}

impl From<Duration> for Expiry {
    fn from(duration: Duration) -> Self {
        Expiry::Millis(duration.as_millis().min(u64::MAX as u128) as u64)
    }
}

/// One page of an incremental set scan.
///
/// A `cursor` of `0` means the scan is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub members: Vec<String>,
}

impl ScanPage {
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }
}

/// Remaining time-to-live reported by [`TagStore::pttl`] for a missing key.
pub const TTL_MISSING: i64 = -2;
/// Remaining time-to-live reported by [`TagStore::pttl`] for a key without expiry.
pub const TTL_PERSISTENT: i64 = -1;

#[async_trait]
pub trait TagStore: Send + Sync + Clone + 'static {
    /// Prefix the store prepends to every key argument.
    fn key_prefix(&self) -> &str;

    /// Fetches a string value. Returns `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Unconditionally stores a value, optionally with an expiry.
    async fn set(&self, key: &str, value: Bytes, expiry: Option<Expiry>)
        -> Result<(), CacheError>;

    /// Stores a value only if the key is absent. Returns whether it was written.
    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<bool, CacheError>;

    /// Writes several keys in a single command.
    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> Result<(), CacheError>;

    /// Deletes keys outright. Returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Adds `delta` to an integer value, creating it at zero when absent.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    /// Adds members to a set. Returns how many were new.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError>;

    /// Removes members from a set. Returns how many were present.
    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CacheError>;

    /// Returns one page of set members starting at `cursor`.
    async fn sscan(&self, key: &str, cursor: u64) -> Result<ScanPage, CacheError>;

    /// Sets an expiry in milliseconds. Zero or negative expires the key now.
    async fn pexpire(&self, key: &str, millis: i64) -> Result<bool, CacheError>;

    /// Remaining time-to-live in milliseconds, or [`TTL_MISSING`] /
    /// [`TTL_PERSISTENT`].
    async fn pttl(&self, key: &str) -> Result<i64, CacheError>;

    /// Deletes `key` only if it currently holds `value`.
    async fn del_if_eq(&self, key: &str, value: &[u8]) -> Result<bool, CacheError>;
}
