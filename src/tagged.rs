//! Tag-scoped views over a store.
//!
//! A [`TaggedCache`] is obtained from [`TaggableCache::tags`](crate::TaggableCache::tags)
//! and binds an ordered list of tag names. Writes through the view register
//! the entry in the reference set of every tag version; reads and deletions
//! through the view operate on the entries carrying *all* of its tags.
//!
//! Entry keys are never namespaced. `cache.tags(["a"]).get("k")` and
//! `cache.plain().get("k")` read the same entry; tags only decide which
//! entries `list`, `flush` and the bulk deletions reach.

use bytes::Bytes;
use futures_util::future::{try_join, try_join_all};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::{debug, instrument};

use crate::backend::{Expiry, TagStore};
use crate::codec::CacheCodec;
use crate::error::CacheError;
use crate::logging::{EventLogConfig, TagEvent, TagEventType};
use crate::plain::PlainCache;
use crate::reference::ReferenceIndex;
use crate::tag_set::TagSet;

/// Cache operations scoped to a set of tags.
pub struct TaggedCache<S> {
    plain: PlainCache<S>,
    tags: TagSet<S>,
    references: ReferenceIndex<S>,
    events: EventLogConfig,
}

impl<S> TaggedCache<S>
where
    S: TagStore,
{
    pub fn new(
        plain: PlainCache<S>,
        tags: TagSet<S>,
        references: ReferenceIndex<S>,
        events: EventLogConfig,
    ) -> Self {
        Self {
            plain,
            tags,
            references,
            events,
        }
    }

    /// The tag set this view is bound to.
    pub fn tags(&self) -> &TagSet<S> {
        &self.tags
    }

    pub fn plain(&self) -> &PlainCache<S> {
        &self.plain
    }

    pub fn references(&self) -> &ReferenceIndex<S> {
        &self.references
    }

    /// Stores `value` under `key` and registers it with every tag.
    ///
    /// The write and the registrations run concurrently; both must succeed.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        expiry: Option<Expiry>,
    ) -> Result<(), CacheError> {
        let namespace = self.tags.namespace().await?;
        try_join(
            self.references.push_keys(&namespace, key),
            self.plain.set(key, value, expiry),
        )
        .await?;
        Ok(())
    }

    pub async fn set_ex(
        &self,
        key: &str,
        seconds: u64,
        value: impl Into<Bytes>,
    ) -> Result<(), CacheError> {
        self.set(key, value, Some(Expiry::Seconds(seconds))).await
    }

    pub async fn pset_ex(
        &self,
        key: &str,
        millis: u64,
        value: impl Into<Bytes>,
    ) -> Result<(), CacheError> {
        self.set(key, value, Some(Expiry::Millis(millis))).await
    }

    /// Encodes `value` with `codec` and stores it like [`TaggedCache::set`].
    pub async fn set_value<C, T>(
        &self,
        codec: &C,
        key: &str,
        value: &T,
        expiry: Option<Expiry>,
    ) -> Result<(), CacheError>
    where
        C: CacheCodec,
        T: Serialize + Sync + ?Sized,
    {
        let bytes = codec.encode(value)?;
        self.set(key, bytes, expiry).await
    }

    /// Reads `key` and decodes it with `codec`.
    pub async fn get_value<C, T>(&self, codec: &C, key: &str) -> Result<Option<T>, CacheError>
    where
        C: CacheCodec,
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(bytes) => codec.decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.plain.get(key).await
    }

    pub async fn get_multiple<K>(
        &self,
        keys: &[K],
    ) -> Result<HashMap<String, Option<Bytes>>, CacheError>
    where
        K: AsRef<str>,
    {
        self.plain.get_multiple(keys).await
    }

    /// Stores several values and registers each of them with every tag.
    pub async fn set_multiple(
        &self,
        values: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let namespace = self.tags.namespace().await?;
        let namespace = namespace.as_str();
        try_join_all(
            values
                .iter()
                .map(|(key, _)| self.references.push_keys(namespace, key)),
        )
        .await?;
        self.plain.set_multiple(values, ttl).await
    }

    /// Stores `value` only if `key` is absent, registering it when written.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let namespace = self.tags.namespace().await?;
        let written = self.plain.add(key, value, ttl).await?;
        if written {
            self.references.push_keys(&namespace, key).await?;
        }
        Ok(written)
    }

    /// Deletes a single entry. Its references are left for
    /// [`TaggedCache::prune_stale_references`].
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.plain.delete(key).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.plain.ttl(key).await
    }

    /// Adds `delta` to a counter and registers it with every tag.
    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let registered = async {
            let namespace = self.tags.namespace().await?;
            self.references.push_keys(&namespace, key).await
        };
        let ((), value) = try_join(registered, self.plain.increment(key, delta)).await?;
        Ok(value)
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        self.increment(key, -delta).await
    }

    async fn current_references(&self) -> Result<Vec<String>, CacheError> {
        let ids = self.tags.tag_ids().await?;
        Ok(self.references.reference_keys_for(&ids))
    }

    /// Logical keys of the entries carrying every tag of this view.
    pub async fn list_keys(&self) -> Result<Vec<String>, CacheError> {
        let references = self.current_references().await?;
        self.references.tagged_keys(&references).await
    }

    /// Values of the entries carrying every tag of this view.
    ///
    /// Entries that expired since they were registered come back as `None`.
    pub async fn list(&self) -> Result<Vec<Option<Bytes>>, CacheError> {
        let keys = self.list_keys().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        try_join_all(keys.iter().map(|key| self.plain.get(key))).await
    }

    /// Deletes every entry registered under any of this view's tags, drops
    /// their reference sets and rotates every tag version.
    ///
    /// Returns the number of entries deleted.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(tags = ?self.tags.names())))]
    pub async fn flush(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let namespace = self.tags.namespace().await?;
        let references = self.references.reference_keys(&namespace);

        let deleted = self.references.delete_values(&references).await?;
        self.tags.reset().await?;

        #[cfg(feature = "tracing")]
        debug!(deleted, "tags flushed");

        self.log_event(TagEventType::Flush, deleted, started);
        Ok(deleted)
    }

    /// Deletes the entries carrying every tag of this view.
    ///
    /// Entries carrying only some of the tags are left untouched.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(tags = ?self.tags.names())))]
    pub async fn delete_with_tags(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let references = self.current_references().await?;
        let deleted = self.references.delete_tagged(&references).await?;

        #[cfg(feature = "tracing")]
        debug!(deleted, "tagged entries deleted");

        self.log_event(TagEventType::DeleteWithTags, deleted, started);
        Ok(deleted)
    }

    /// Drains every tag's reference set page by page, deleting each page's
    /// entries as it goes.
    ///
    /// Returns the number of pages processed.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(tags = ?self.tags.names())))]
    pub async fn batch_delete_with_tags(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let references = self.current_references().await?;
        let pages = self.references.batch_delete(&references).await?;

        #[cfg(feature = "tracing")]
        debug!(pages, "reference sets drained");

        self.log_event(TagEventType::BatchDelete, pages, started);
        Ok(pages)
    }

    /// Applies `op` to every key carrying all of this view's tags.
    ///
    /// At most `concurrency` calls run at once; `None` runs them all at once.
    /// Fails as soon as any call fails. Outputs are paired with their key and
    /// arrive in completion order.
    pub async fn bulk<F, Fut, T>(
        &self,
        op: F,
        concurrency: Option<usize>,
    ) -> Result<Vec<(String, T)>, CacheError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let keys = self.list_keys().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let limit = concurrency.unwrap_or(keys.len()).max(1);
        let op = &op;

        stream::iter(keys)
            .map(|key| async move {
                let output = op(key.clone()).await?;
                Ok::<_, CacheError>((key, output))
            })
            .buffer_unordered(limit)
            .try_collect()
            .await
    }

    /// Expires every entry carrying all of this view's tags immediately.
    ///
    /// Returns the number of entries that still existed.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(tags = ?self.tags.names())))]
    pub async fn invalidate_with_tags(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let store = self.plain.store();
        let expired = self
            .bulk(|key| async move { store.pexpire(&key, 0).await }, None)
            .await?
            .into_iter()
            .filter(|(_, existed)| *existed)
            .count();

        self.log_event(TagEventType::Invalidate, expired, started);
        Ok(expired)
    }

    /// Removes references to entries that no longer exist from this view's
    /// reference sets.
    ///
    /// Reads already skip such entries; pruning only reclaims space.
    pub async fn prune_stale_references(&self) -> Result<usize, CacheError> {
        let started = Instant::now();
        let references = self.current_references().await?;
        let pruned = self.references.prune(&references).await?;

        self.log_event(TagEventType::Prune, pruned, started);
        Ok(pruned)
    }

    /// Rotates every tag of this view. Entries stay in the store but are no
    /// longer reachable through these tags.
    pub async fn reset(&self) -> Result<(), CacheError> {
        self.tags.reset().await
    }

    /// Rotates one tag. Returns its new version id.
    pub async fn reset_tag(&self, name: &str) -> Result<String, CacheError> {
        self.tags.reset_tag(name).await
    }

    fn log_event(&self, event_type: TagEventType, keys_affected: usize, started: Instant) {
        TagEvent::new(event_type, self.tags.names().to_vec())
            .with_keys_affected(keys_affected)
            .with_latency(started.elapsed())
            .log(&self.events);
    }
}
