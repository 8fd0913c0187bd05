//! Distributed locking for tag-version creation.
//!
//! Creating a tag version must be serialized across every process sharing a
//! store, otherwise two writers can each publish their own version and split
//! subsequent writes across two namespaces. [`StoreLock`] implements the
//! single-instance lock protocol on top of [`TagStore`]: `SET resource token
//! NX PX ttl` to acquire and a compare-and-delete on the token to release.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use metrics::counter;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::backend::{Expiry, TagStore};
use crate::config::LockConfig;
use crate::error::CacheError;

/// Proof of a held lock. Hand it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    resource: String,
    token: String,
    expires_at: Instant,
}

impl LockGuard {
    pub fn new(resource: impl Into<String>, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            resource: resource.into(),
            token: token.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns `true` once the lock's time-to-live has elapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cross-process mutual exclusion on a named resource.
#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Acquires `resource` for at most `ttl`.
    ///
    /// Fails with [`CacheError::LockUnavailable`] once the retry budget is
    /// exhausted.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, CacheError>;

    /// Releases a held lock. Idempotent; errors are swallowed.
    async fn release(&self, guard: LockGuard);
}

/// [`DistributedLock`] backed by the tag store itself.
#[derive(Clone)]
pub struct StoreLock<S> {
    store: S,
    config: LockConfig,
}

impl<S> StoreLock<S>
where
    S: TagStore,
{
    pub fn new(store: S, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl<S> DistributedLock for StoreLock<S>
where
    S: TagStore,
{
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, CacheError> {
        let token = Uuid::new_v4().simple().to_string();
        let attempts = self.config.retry_count.saturating_add(1);

        for attempt in 1..=attempts {
            let acquired = self
                .store
                .set_nx(
                    resource,
                    Bytes::from(token.clone()),
                    Some(Expiry::from(ttl)),
                )
                .await?;
            if acquired {
                #[cfg(feature = "tracing")]
                debug!(resource = %resource, attempt, "lock acquired");

                return Ok(LockGuard::new(resource, token, ttl));
            }

            #[cfg(feature = "metrics")]
            counter!("redis_tagged_cache.lock.contended").increment(1);

            if attempt < attempts {
                sleep(self.retry_delay()).await;
            }
        }

        #[cfg(feature = "metrics")]
        counter!("redis_tagged_cache.lock.exhausted").increment(1);

        #[cfg(feature = "tracing")]
        warn!(resource = %resource, attempts, "lock retry budget exhausted");

        Err(CacheError::LockUnavailable {
            resource: resource.to_owned(),
            attempts,
        })
    }

    async fn release(&self, guard: LockGuard) {
        if guard.is_expired() {
            return;
        }
        if let Err(_err) = self
            .store
            .del_if_eq(guard.resource(), guard.token().as_bytes())
            .await
        {
            #[cfg(feature = "tracing")]
            warn!(resource = %guard.resource(), error = %_err, "lock release failed");
        }
    }
}
