//! Store doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis_tagged_cache::backend::memory::InMemoryStore;
use redis_tagged_cache::backend::{Expiry, ScanPage, TagStore};
use redis_tagged_cache::error::CacheError;
use tokio::time::sleep;

#[derive(Default)]
pub struct Counters {
    pub gets: AtomicUsize,
    pub sscans: AtomicUsize,
    pub dels: AtomicUsize,
}

impl Counters {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sscans(&self) -> usize {
        self.sscans.load(Ordering::SeqCst)
    }

    pub fn dels(&self) -> usize {
        self.dels.load(Ordering::SeqCst)
    }
}

/// Wraps an [`InMemoryStore`], counting reads. Reads can be slowed down, and
/// reads, `SET` or `SADD` can be made to fail.
#[derive(Clone)]
pub struct InstrumentedStore {
    inner: InMemoryStore,
    counters: Arc<Counters>,
    read_delay: Duration,
    fail_reads: Arc<AtomicBool>,
    fail_sets: Arc<AtomicBool>,
    fail_sadds: Arc<AtomicBool>,
}

impl InstrumentedStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            counters: Arc::new(Counters::default()),
            read_delay: Duration::ZERO,
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_sets: Arc::new(AtomicBool::new(false)),
            fail_sadds: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes plain `SET` fail. `SET NX` and `MSET` are unaffected.
    pub fn fail_sets(&self, fail: bool) {
        self.fail_sets.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sadds(&self, fail: bool) {
        self.fail_sadds.store(fail, Ordering::SeqCst);
    }

    async fn before_read(&self) -> Result<(), CacheError> {
        if !self.read_delay.is_zero() {
            sleep(self.read_delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("connection reset".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl TagStore for InstrumentedStore {
    fn key_prefix(&self) -> &str {
        self.inner.key_prefix()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, expiry: Option<Expiry>) -> Result<(), CacheError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("write refused".to_owned()));
        }
        self.inner.set(key, value, expiry).await
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<bool, CacheError> {
        self.inner.set_nx(key, value, expiry).await
    }

    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> Result<(), CacheError> {
        self.inner.mset(pairs).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.counters.dels.fetch_add(1, Ordering::SeqCst);
        self.inner.del(keys).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.inner.incr_by(key, delta).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        if self.fail_sadds.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("write refused".to_owned()));
        }
        self.inner.sadd(key, members).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        self.inner.srem(key, members).await
    }

    async fn sscan(&self, key: &str, cursor: u64) -> Result<ScanPage, CacheError> {
        self.counters.sscans.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        self.inner.sscan(key, cursor).await
    }

    async fn pexpire(&self, key: &str, millis: i64) -> Result<bool, CacheError> {
        self.inner.pexpire(key, millis).await
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        self.inner.pttl(key).await
    }

    async fn del_if_eq(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        self.inner.del_if_eq(key, value).await
    }
}
