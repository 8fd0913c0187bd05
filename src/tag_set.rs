//! Tag versions and namespace composition.
//!
//! Every tag name maps to an opaque version id stored under `tag:<name>:key`.
//! A view's namespace is the `|`-joined list of its tags' current versions,
//! so rotating any one version yields a new namespace and orphans whatever
//! was registered under the old one.

use bytes::Bytes;
use futures_util::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use metrics::counter;

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::backend::{Expiry, TagStore};
use crate::coalesce::Coalescer;
use crate::config::TaggedCacheConfig;
use crate::error::CacheError;
use crate::lock::DistributedLock;
use crate::logging::{EventLogConfig, TagEvent, TagEventType};

/// Separator between version ids inside a namespace.
pub const NAMESPACE_SEPARATOR: &str = "|";

/// Returns the store key holding the current version id of `name`.
pub fn tag_key(name: &str) -> String {
    format!("tag:{name}:key")
}

/// Returns the lock resource guarding version creation for `name`.
pub fn lock_resource(name: &str) -> String {
    format!("{}:lock", tag_key(name))
}

fn new_version_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn decode_version(bytes: Bytes) -> Result<String, CacheError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|err| CacheError::Backend(format!("tag version is not valid UTF-8: {err}")))
}

/// An ordered set of tag names and the versions they currently resolve to.
pub struct TagSet<S> {
    names: Vec<String>,
    coalescer: Coalescer<S>,
    lock: Arc<dyn DistributedLock>,
    lock_ttl: Duration,
    tag_ttl: Option<Duration>,
    events: EventLogConfig,
    namespace: RwLock<Option<String>>,
}

impl<S> TagSet<S>
where
    S: TagStore,
{
    pub fn new(
        names: Vec<String>,
        coalescer: Coalescer<S>,
        lock: Arc<dyn DistributedLock>,
        config: &TaggedCacheConfig,
    ) -> Self {
        Self {
            names,
            coalescer,
            lock,
            lock_ttl: config.lock.ttl,
            tag_ttl: config.tag_ttl,
            events: config.events.clone(),
            namespace: RwLock::new(None),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn store(&self) -> &S {
        self.coalescer.store()
    }

    /// Returns the namespace for this set, resolving versions on first use.
    ///
    /// The value is cached until this set resets one of its tags.
    pub async fn namespace(&self) -> Result<String, CacheError> {
        if let Some(namespace) = self.namespace.read().await.as_ref() {
            return Ok(namespace.clone());
        }

        let ids = self.tag_ids().await?;
        let namespace = ids.join(NAMESPACE_SEPARATOR);
        *self.namespace.write().await = Some(namespace.clone());
        Ok(namespace)
    }

    /// Resolves the current version of every tag, in name order.
    pub async fn tag_ids(&self) -> Result<Vec<String>, CacheError> {
        try_join_all(self.names.iter().map(|name| self.resolve_version(name))).await
    }

    /// Returns the current version of `name`, creating one if none exists.
    pub async fn resolve_version(&self, name: &str) -> Result<String, CacheError> {
        match self.coalescer.get(&tag_key(name)).await? {
            Some(id) => decode_version(id),
            None => self.create_version(name).await,
        }
    }

    /// Creates the first version of `name` under the tag's lock.
    ///
    /// The lock is released whether or not the write succeeded.
    async fn create_version(&self, name: &str) -> Result<String, CacheError> {
        let guard = self.lock.acquire(&lock_resource(name), self.lock_ttl).await?;
        let result = self.publish_if_absent(name).await;
        self.lock.release(guard).await;
        result
    }

    async fn publish_if_absent(&self, name: &str) -> Result<String, CacheError> {
        let key = tag_key(name);
        // Read past the coalescer: an in-flight GET may predate the holder
        // that just released this lock.
        if let Some(existing) = self.store().get(&key).await? {
            if let Some(ttl) = self.tag_ttl {
                self.store().pexpire(&key, ttl.as_millis() as i64).await?;
            }
            return decode_version(existing);
        }

        let id = new_version_id();
        self.store()
            .set(&key, Bytes::from(id.clone()), self.tag_ttl.map(Expiry::from))
            .await?;

        #[cfg(feature = "metrics")]
        counter!("redis_tagged_cache.tag.version_created").increment(1);

        #[cfg(feature = "tracing")]
        debug!(tag = %name, version = %id, "tag version created");

        TagEvent::new(TagEventType::VersionCreated, vec![name.to_owned()]).log(&self.events);
        Ok(id)
    }

    /// Rotates every tag in the set with a single multi-key write.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let pairs: Vec<(String, Bytes)> = self
            .names
            .iter()
            .map(|name| (tag_key(name), Bytes::from(new_version_id())))
            .collect();
        let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();

        self.store().mset(pairs).await?;
        if let Some(ttl) = self.tag_ttl {
            let millis = ttl.as_millis() as i64;
            try_join_all(keys.iter().map(|key| self.store().pexpire(key, millis))).await?;
        }
        self.namespace.write().await.take();

        #[cfg(feature = "tracing")]
        debug!(tags = ?self.names, "tag versions reset");

        TagEvent::new(TagEventType::Reset, self.names.clone()).log(&self.events);
        Ok(())
    }

    /// Rotates a single tag's version.
    pub async fn reset_tag(&self, name: &str) -> Result<String, CacheError> {
        let id = new_version_id();
        self.store()
            .set(
                &tag_key(name),
                Bytes::from(id.clone()),
                self.tag_ttl.map(Expiry::from),
            )
            .await?;
        self.namespace.write().await.take();

        #[cfg(feature = "tracing")]
        debug!(tag = %name, version = %id, "tag version rotated");

        TagEvent::new(TagEventType::Reset, vec![name.to_owned()]).log(&self.events);
        Ok(id)
    }
}
