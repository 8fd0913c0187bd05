//! Untagged key/value access.
//!
//! [`PlainCache`] forwards single-key commands to the store. Reads go through
//! the shared [`Coalescer`], so a plain `get` and a tagged `get` of the same
//! key issued concurrently cost one round-trip.

use bytes::Bytes;
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::time::Duration;

use crate::backend::{Expiry, TagStore, TTL_MISSING, TTL_PERSISTENT};
use crate::coalesce::Coalescer;
use crate::error::CacheError;

/// Pass-through cache over a [`TagStore`].
#[derive(Clone)]
pub struct PlainCache<S> {
    coalescer: Coalescer<S>,
}

impl<S> PlainCache<S>
where
    S: TagStore,
{
    pub fn new(coalescer: Coalescer<S>) -> Self {
        Self { coalescer }
    }

    pub fn store(&self) -> &S {
        self.coalescer.store()
    }

    pub fn coalescer(&self) -> &Coalescer<S> {
        &self.coalescer
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.coalescer.get(key).await
    }

    /// Fetches several keys. Missing keys map to `None`.
    pub async fn get_multiple<K>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<String, Option<Bytes>>, CacheError>
    where
        K: AsRef<str>,
    {
        let values = try_join_all(keys.iter().map(|key| self.get(key.as_ref()))).await?;
        Ok(keys
            .iter()
            .map(|key| key.as_ref().to_owned())
            .zip(values)
            .collect())
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        expiry: Option<Expiry>,
    ) -> Result<(), CacheError> {
        self.store().set(key, value.into(), expiry).await
    }

    /// Stores a value that expires after `seconds`.
    pub async fn set_ex(
        &self,
        key: &str,
        seconds: u64,
        value: impl Into<Bytes>,
    ) -> Result<(), CacheError> {
        self.set(key, value, Some(Expiry::Seconds(seconds))).await
    }

    /// Stores a value that expires after `millis`.
    pub async fn pset_ex(
        &self,
        key: &str,
        millis: u64,
        value: impl Into<Bytes>,
    ) -> Result<(), CacheError> {
        self.set(key, value, Some(Expiry::Millis(millis))).await
    }

    /// Stores several values, each with the same optional lifetime.
    pub async fn set_multiple(
        &self,
        values: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expiry = ttl.map(Expiry::from);
        try_join_all(
            values
                .into_iter()
                .map(|(key, value)| async move { self.store().set(&key, value, expiry).await }),
        )
        .await?;
        Ok(())
    }

    /// Stores a value only if `key` is absent. Returns whether it was written.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.store()
            .set_nx(key, value.into(), ttl.map(Expiry::from))
            .await
    }

    /// Deletes `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store().del(&[key.to_owned()]).await? > 0)
    }

    /// Deletes several keys. Returns how many existed.
    pub async fn delete_multiple<K>(&self, keys: &[K]) -> Result<u64, CacheError>
    where
        K: AsRef<str>,
    {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|key| key.as_ref().to_owned()).collect();
        self.store().del(&keys).await
    }

    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.store().incr_by(key, delta).await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.store().incr_by(key, -delta).await
    }

    /// Remaining lifetime of `key`.
    ///
    /// `Ok(None)` means the key is absent or never expires; use
    /// [`PlainCache::exists`] to tell the two apart.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        match self.store().pttl(key).await? {
            TTL_MISSING | TTL_PERSISTENT => Ok(None),
            millis if millis < 0 => Ok(None),
            millis => Ok(Some(Duration::from_millis(millis as u64))),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.store().pttl(key).await? != TTL_MISSING)
    }

    /// Sets a new lifetime on `key`. A zero duration expires it immediately.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let millis = ttl.as_millis().min(i64::MAX as u128) as i64;
        self.store().pexpire(key, millis).await
    }
}
