//! Reference sets: which cache keys belong to which tag version.
//!
//! Each tag version owns a set stored under `<tag_prefix><version>` whose
//! members are the fully-qualified keys of the entries written under it.
//! Queries over several tags intersect those sets; deletions either collect
//! the full membership first or drain a set page by page.
//!
//! Draining is expressed as a chain of [`Continuation`]s run by
//! [`trampoline`], so arbitrarily large sets are processed in a flat loop.

use futures_util::future::{try_join, try_join_all, BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::future::Future;

#[cfg(feature = "metrics")]
use metrics::counter;

#[cfg(feature = "tracing")]
use tracing::trace;

use crate::backend::{ScanPage, TagStore, TTL_MISSING};
use crate::coalesce::Coalescer;
use crate::config::TaggedCacheConfig;
use crate::error::CacheError;
use crate::tag_set::NAMESPACE_SEPARATOR;

type StepFuture<'a> = BoxFuture<'a, Result<Option<Continuation<'a>>, CacheError>>;

/// The next unit of work in a trampolined computation.
pub struct Continuation<'a> {
    step: Box<dyn FnOnce() -> StepFuture<'a> + Send + 'a>,
}

impl<'a> Continuation<'a> {
    pub fn new<F, Fut>(step: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Option<Continuation<'a>>, CacheError>> + Send + 'a,
    {
        Self {
            step: Box::new(move || step().boxed()),
        }
    }

    /// Runs this step, yielding the following one or `None` when done.
    pub async fn run(self) -> Result<Option<Continuation<'a>>, CacheError> {
        (self.step)().await
    }
}

/// Runs continuations until one reports completion.
///
/// Returns the number of steps executed.
pub async fn trampoline(first: Option<Continuation<'_>>) -> Result<usize, CacheError> {
    let mut steps = 0;
    let mut next = first;
    while let Some(step) = next {
        steps += 1;
        next = step.run().await?;
    }
    Ok(steps)
}

/// Intersects member lists, keeping the order of the first list.
///
/// Duplicates are dropped. An empty input yields an empty result.
pub fn intersect(mut sets: Vec<Vec<String>>) -> Vec<String> {
    if sets.is_empty() {
        return Vec::new();
    }
    let first = sets.remove(0);
    let others: Vec<HashSet<String>> = sets
        .into_iter()
        .map(|set| set.into_iter().collect())
        .collect();

    let mut seen = HashSet::new();
    first
        .into_iter()
        .filter(|member| others.iter().all(|other| other.contains(member)))
        .filter(|member| seen.insert(member.clone()))
        .collect()
}

fn dedupe(members: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    members
        .into_iter()
        .filter(|member| seen.insert(member.clone()))
        .collect()
}

/// Bookkeeping of tag-version reference sets.
#[derive(Clone)]
pub struct ReferenceIndex<S> {
    coalescer: Coalescer<S>,
    tag_prefix: String,
    delete_chunk_size: usize,
    delete_concurrency: usize,
}

impl<S> ReferenceIndex<S>
where
    S: TagStore,
{
    pub fn new(coalescer: Coalescer<S>, config: &TaggedCacheConfig) -> Self {
        Self {
            coalescer,
            tag_prefix: config.tag_prefix.clone(),
            delete_chunk_size: config.delete_chunk_size.max(1),
            delete_concurrency: config.delete_concurrency.max(1),
        }
    }

    fn store(&self) -> &S {
        self.coalescer.store()
    }

    /// Key of the reference set owned by a tag version.
    pub fn reference_key(&self, version: &str) -> String {
        format!("{}{}", self.tag_prefix, version)
    }

    /// Reference keys for every segment of `namespace`.
    pub fn reference_keys(&self, namespace: &str) -> Vec<String> {
        namespace
            .split(NAMESPACE_SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(|segment| self.reference_key(segment))
            .collect()
    }

    /// Reference keys for a list of tag versions.
    pub fn reference_keys_for(&self, versions: &[String]) -> Vec<String> {
        versions
            .iter()
            .map(|version| self.reference_key(version))
            .collect()
    }

    /// The key as the store sees it, prefix included.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.store().key_prefix(), key)
    }

    /// Translates a reference-set member back into a logical key.
    pub fn logical_key(&self, member: &str) -> String {
        member
            .strip_prefix(self.store().key_prefix())
            .unwrap_or(member)
            .to_owned()
    }

    /// Registers `key` in the reference set of every segment of `namespace`.
    pub async fn push_keys(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let member = [self.full_key(key)];
        let references = self.reference_keys(namespace);
        try_join_all(
            references
                .iter()
                .map(|reference| self.store().sadd(reference, &member)),
        )
        .await?;
        Ok(())
    }

    /// Fetches one page of a reference set.
    pub async fn member_page(&self, set_key: &str, cursor: u64) -> Result<ScanPage, CacheError> {
        self.coalescer.sscan(set_key, cursor).await
    }

    /// Reads the full membership of a reference set, page by page.
    pub async fn all_members(&self, set_key: &str) -> Result<Vec<String>, CacheError> {
        let mut members = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.member_page(set_key, cursor).await?;
            members.extend(page.members);
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        Ok(dedupe(members))
    }

    async fn members_by_reference(
        &self,
        reference_keys: &[String],
    ) -> Result<Vec<Vec<String>>, CacheError> {
        try_join_all(reference_keys.iter().map(|key| self.all_members(key))).await
    }

    /// Fully-qualified keys present in *every* given reference set.
    pub async fn intersected_members(
        &self,
        reference_keys: &[String],
    ) -> Result<Vec<String>, CacheError> {
        Ok(intersect(self.members_by_reference(reference_keys).await?))
    }

    /// Logical keys present in every given reference set.
    pub async fn tagged_keys(&self, reference_keys: &[String]) -> Result<Vec<String>, CacheError> {
        let members = self.intersected_members(reference_keys).await?;
        Ok(members
            .iter()
            .map(|member| self.logical_key(member))
            .collect())
    }

    /// Deletes entries in chunks with bounded concurrency.
    pub async fn delete_entries(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let store = self.store();
        let removed: Vec<u64> = stream::iter(keys.chunks(self.delete_chunk_size))
            .map(|chunk| store.del(chunk))
            .buffer_unordered(self.delete_concurrency)
            .try_collect()
            .await?;
        Ok(removed.into_iter().sum())
    }

    /// Removes the intersection of `reference_keys` from each set and deletes
    /// the matching entries.
    ///
    /// Entries that carry only some of the tags are left alone.
    pub async fn delete_tagged(&self, reference_keys: &[String]) -> Result<usize, CacheError> {
        let members = self.intersected_members(reference_keys).await?;
        if members.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = members
            .iter()
            .map(|member| self.logical_key(member))
            .collect();

        try_join(
            try_join_all(
                reference_keys
                    .iter()
                    .map(|reference| self.store().srem(reference, &members)),
            ),
            self.delete_entries(&keys),
        )
        .await?;

        #[cfg(feature = "metrics")]
        counter!("redis_tagged_cache.entries.deleted").increment(keys.len() as u64);

        Ok(keys.len())
    }

    /// Deletes every entry referenced by each set, then the sets themselves.
    pub async fn delete_values(&self, reference_keys: &[String]) -> Result<usize, CacheError> {
        let mut deleted = 0;
        for members in self.members_by_reference(reference_keys).await? {
            if members.is_empty() {
                continue;
            }
            let keys: Vec<String> = members
                .iter()
                .map(|member| self.logical_key(member))
                .collect();
            self.delete_entries(&keys).await?;
            deleted += keys.len();
        }
        self.store().del(reference_keys).await?;

        #[cfg(feature = "metrics")]
        counter!("redis_tagged_cache.entries.deleted").increment(deleted as u64);

        Ok(deleted)
    }

    /// Processes one page of a reference set: unregisters its members and
    /// deletes their entries.
    ///
    /// Returns the continuation for the next page, or `None` once the scan
    /// cursor comes back as `0`.
    pub fn batch_delete_tag_members<'a>(
        &'a self,
        set_key: &'a str,
        cursor: u64,
    ) -> StepFuture<'a> {
        async move {
            let page = self.member_page(set_key, cursor).await?;
            let members = dedupe(page.members);

            if !members.is_empty() {
                let keys: Vec<String> = members
                    .iter()
                    .map(|member| self.logical_key(member))
                    .collect();
                try_join(
                    self.store().srem(set_key, &members),
                    self.store().del(&keys),
                )
                .await?;

                #[cfg(feature = "metrics")]
                counter!("redis_tagged_cache.entries.deleted").increment(keys.len() as u64);

                #[cfg(feature = "tracing")]
                trace!(
                    reference = %set_key,
                    cursor,
                    deleted = keys.len(),
                    "reference page drained"
                );
            }

            if page.cursor == 0 {
                return Ok(None);
            }
            let next = page.cursor;
            Ok(Some(Continuation::new(move || {
                self.batch_delete_tag_members(set_key, next)
            })))
        }
        .boxed()
    }

    /// Drains each reference set page by page. Returns the pages processed.
    pub async fn batch_delete(&self, reference_keys: &[String]) -> Result<usize, CacheError> {
        let pages = try_join_all(reference_keys.iter().map(|key| {
            trampoline(Some(Continuation::new(move || {
                self.batch_delete_tag_members(key, 0)
            })))
        }))
        .await?;
        Ok(pages.into_iter().sum())
    }

    /// Removes members whose entry no longer exists from each reference set.
    ///
    /// Returns the number of dangling references removed.
    pub async fn prune(&self, reference_keys: &[String]) -> Result<usize, CacheError> {
        let mut pruned = 0;
        for reference in reference_keys {
            let mut cursor = 0;
            loop {
                let page = self.member_page(reference, cursor).await?;
                let members = dedupe(page.members);
                let ttls = try_join_all(members.iter().map(|member| {
                    let key = self.logical_key(member);
                    async move { self.store().pttl(&key).await }
                }))
                .await?;
                let dangling: Vec<String> = members
                    .into_iter()
                    .zip(ttls)
                    .filter(|(_, ttl)| *ttl == TTL_MISSING)
                    .map(|(member, _)| member)
                    .collect();
                if !dangling.is_empty() {
                    pruned += self.store().srem(reference, &dangling).await? as usize;
                }
                if page.cursor == 0 {
                    break;
                }
                cursor = page.cursor;
            }
        }
        Ok(pruned)
    }
}
