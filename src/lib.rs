//! Redis Tagged Cache
//! ==================
//!
//! `redis-tagged-cache` adds tag-based invalidation on top of a Redis-class
//! key/value store. Entries are written through a view bound to a list of
//! tags; later, every entry sharing those tags can be listed, deleted or
//! expired in a handful of round-trips, from any process sharing the store.
//!
//! Each tag resolves to an opaque version id. Writes register the entry key
//! in one reference set per tag version, and rotating a version orphans
//! everything registered under the old one. Version creation is serialized
//! across processes by a lock held in the store, and identical concurrent
//! reads are coalesced into one request.
//!
//! ```no_run
//! use redis_tagged_cache::prelude::*;
//!
//! # async fn run() -> Result<(), CacheError> {
//! let cache = TaggableCache::new(InMemoryStore::new());
//!
//! cache.tags(["tag_0", "post_0"]).set("post_0", "Post 0!", None).await?;
//! assert_eq!(cache.plain().get("post_0").await?.as_deref(), Some(&b"Post 0!"[..]));
//!
//! let posts = cache.tags(["tag_0"]).list().await?;
//! assert_eq!(posts.len(), 1);
//!
//! cache.tags(["tag_0"]).flush().await?;
//! assert!(cache.plain().get("post_0").await?.is_none());
//! # Ok(())
//! # }
//! ```
//!
//! ## Status
//! The public API is not yet stabilized.

pub mod backend;
pub mod coalesce;
pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod plain;
pub mod prelude;
pub mod reference;
pub mod tag_set;
pub mod tagged;

use std::sync::Arc;

use backend::TagStore;
use coalesce::Coalescer;
use config::TaggedCacheConfig;
use error::CacheError;
use lock::{DistributedLock, StoreLock};
use plain::PlainCache;
use reference::ReferenceIndex;
use tag_set::TagSet;
use tagged::TaggedCache;

pub use config::LockConfig;
pub use logging::{EventLogConfig, TagEvent, TagEventType};

/// Entry point exposing plain and tagged access to one store.
///
/// Cloning is cheap: clones share the store client, the coalescer and the
/// lock.
#[derive(Clone)]
pub struct TaggableCache<S> {
    plain: PlainCache<S>,
    lock: Arc<dyn DistributedLock>,
    config: Arc<TaggedCacheConfig>,
}

impl<S> TaggableCache<S>
where
    S: TagStore,
{
    /// Wraps `store` with the default configuration.
    pub fn new(store: S) -> Self {
        Self::build(store, TaggedCacheConfig::default())
    }

    /// Wraps `store` with a validated configuration.
    pub fn with_config(store: S, config: TaggedCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self::build(store, config))
    }

    fn build(store: S, config: TaggedCacheConfig) -> Self {
        let lock = Arc::new(StoreLock::new(store.clone(), config.lock.clone()));
        Self {
            plain: PlainCache::new(Coalescer::new(store)),
            lock,
            config: Arc::new(config),
        }
    }

    /// Replaces the lock guarding tag-version creation.
    pub fn with_lock<L>(mut self, lock: L) -> Self
    where
        L: DistributedLock,
    {
        self.lock = Arc::new(lock);
        self
    }

    /// Returns a view bound to `names`, in the given order.
    pub fn tags<I, N>(&self, names: I) -> TaggedCache<S>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let coalescer = self.plain.coalescer().clone();
        let tags = TagSet::new(
            names.into_iter().map(Into::into).collect(),
            coalescer.clone(),
            self.lock.clone(),
            &self.config,
        );
        let references = ReferenceIndex::new(coalescer, &self.config);
        TaggedCache::new(
            self.plain.clone(),
            tags,
            references,
            self.config.events.clone(),
        )
    }

    /// Untagged access to the same store.
    pub fn plain(&self) -> &PlainCache<S> {
        &self.plain
    }

    pub fn store(&self) -> &S {
        self.plain.store()
    }

    pub fn config(&self) -> &TaggedCacheConfig {
        &self.config
    }
}
