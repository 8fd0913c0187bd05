mod common;

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use common::InstrumentedStore;
use futures_util::future::join_all;
use redis_tagged_cache::prelude::*;
use redis_tagged_cache::tag_set::{lock_resource, tag_key};

fn fast_lock() -> LockConfig {
    LockConfig::default()
        .with_retry_count(200)
        .with_retry_delay(Duration::from_millis(5))
        .with_retry_jitter(Duration::from_millis(5))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_processes_agree_on_one_version() {
    let shared = InMemoryStore::new();
    let store = InstrumentedStore::new(shared.clone()).with_read_delay(Duration::from_millis(10));

    // Each handle stands in for a separate process: its own coalescer and lock.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            TaggableCache::with_config(
                store.clone(),
                TaggedCacheConfig::default().with_lock(fast_lock()),
            )
            .expect("valid config")
        })
        .collect();

    let tasks = handles.into_iter().map(|cache| {
        tokio::spawn(async move { cache.tags(["contested"]).tags().tag_ids().await })
    });
    let ids: HashSet<String> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task joined").expect("tag ids")[0].clone())
        .collect();

    assert_eq!(ids.len(), 1, "every process sees the same version: {ids:?}");
    let stored = shared
        .get(&tag_key("contested"))
        .await
        .expect("get")
        .expect("version published");
    assert_eq!(
        String::from_utf8(stored.to_vec()).expect("utf-8"),
        ids.into_iter().next().expect("one id")
    );
    assert!(!shared.contains_key(&lock_resource("contested")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_share_one_namespace() {
    let shared = InMemoryStore::new();
    let store = InstrumentedStore::new(shared.clone()).with_read_delay(Duration::from_millis(5));

    let tasks = (0..6).map(|i| {
        let cache = TaggableCache::with_config(
            store.clone(),
            TaggedCacheConfig::default().with_lock(fast_lock()),
        )
        .expect("valid config");
        tokio::spawn(async move {
            cache
                .tags(["feed"])
                .set(&format!("entry_{i}"), "v", None)
                .await
        })
    });
    for joined in join_all(tasks).await {
        joined.expect("task joined").expect("set");
    }

    let listed = TaggableCache::new(shared)
        .tags(["feed"])
        .list_keys()
        .await
        .expect("list");
    assert_eq!(listed.len(), 6);
}

#[tokio::test]
async fn concurrent_identical_reads_hit_the_store_once() {
    let store =
        InstrumentedStore::new(InMemoryStore::new()).with_read_delay(Duration::from_millis(20));
    store
        .inner()
        .set("hot", Bytes::from_static(b"value"), None)
        .await
        .expect("seed");
    let cache = TaggableCache::new(store.clone());
    let view = cache.tags(["t"]);

    let plain = cache.plain();
    let view = &view;
    let reads = (0..16).map(|i| async move {
        if i % 2 == 0 {
            plain.get("hot").await
        } else {
            view.get("hot").await
        }
    });
    let results = join_all(reads).await;

    assert_eq!(store.counters().gets(), 1);
    for result in results {
        assert_eq!(result.expect("read"), Some(Bytes::from_static(b"value")));
    }
    assert_eq!(cache.plain().coalescer().in_flight(), 0);

    cache.plain().get("hot").await.expect("read");
    assert_eq!(store.counters().gets(), 2);
}

#[tokio::test]
async fn concurrent_failures_share_one_error() {
    let store =
        InstrumentedStore::new(InMemoryStore::new()).with_read_delay(Duration::from_millis(20));
    store.fail_reads(true);
    let cache = TaggableCache::new(store.clone());

    let results = join_all((0..8).map(|_| cache.plain().get("hot"))).await;

    assert_eq!(store.counters().gets(), 1);
    for result in results {
        let err = result.expect_err("read fails");
        assert!(matches!(
            err.root(),
            CacheError::Backend(message) if message == "connection reset"
        ));
    }

    store.fail_reads(false);
    assert_eq!(cache.plain().get("hot").await.expect("read"), None);
}

#[tokio::test]
async fn batch_delete_fetches_each_page_once() {
    let store = InstrumentedStore::new(InMemoryStore::new().with_scan_count(10));
    let cache = TaggableCache::new(store.clone());
    let view = cache.tags(["paged"]);
    for i in 0..95 {
        view.set(&format!("item_{i}"), "v", None).await.expect("set");
    }

    let before = store.counters().sscans();
    let pages = view.batch_delete_with_tags().await.expect("batch delete");

    assert_eq!(pages, 10);
    assert_eq!(store.counters().sscans() - before, 10);
    assert!(view.list_keys().await.expect("list").is_empty());
    assert!((0..95).all(|i| !store.inner().contains_key(&format!("item_{i}"))));
}

#[tokio::test]
async fn batch_delete_of_a_large_set_stays_flat() {
    let store = InMemoryStore::new().with_scan_count(1);
    let cache = TaggableCache::new(store.clone());
    let view = cache.tags(["deep"]);
    let count = 5_000;
    view.set_multiple(
        (0..count)
            .map(|i| (format!("item_{i}"), Bytes::from_static(b"v")))
            .collect(),
        None,
    )
    .await
    .expect("set multiple");

    let pages = view.batch_delete_with_tags().await.expect("batch delete");
    assert_eq!(pages, count);
    assert!(!store.contains_key("item_0"));
    assert!(!store.contains_key(&format!("item_{}", count - 1)));
}

#[tokio::test]
async fn flush_deletes_in_bounded_chunks() {
    let store = InstrumentedStore::new(InMemoryStore::new());
    let cache = TaggableCache::with_config(
        store.clone(),
        TaggedCacheConfig::default()
            .with_delete_chunk_size(10)
            .with_delete_concurrency(3),
    )
    .expect("valid config");
    let view = cache.tags(["chunked"]);
    for i in 0..45 {
        view.set(&format!("item_{i}"), "v", None).await.expect("set");
    }

    let before = store.counters().dels();
    assert_eq!(view.flush().await.expect("flush"), 45);

    // Five entry chunks plus the reference set itself.
    assert_eq!(store.counters().dels() - before, 6);
}

#[tokio::test]
async fn abandoned_reads_do_not_pin_their_slots() {
    let store =
        InstrumentedStore::new(InMemoryStore::new()).with_read_delay(Duration::from_millis(50));
    let cache = TaggableCache::new(store.clone());

    for i in 0..100 {
        let key = format!("k{i}");
        let read = cache.plain().get(&key);
        let waited = tokio::time::timeout(Duration::from_millis(1), read).await;
        assert!(waited.is_err(), "read should outlast the timeout");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.plain().coalescer().in_flight(), 0);

    let before = store.counters().gets();
    store
        .inner()
        .set("k0", Bytes::from_static(b"fresh"), None)
        .await
        .expect("seed");
    assert_eq!(
        cache.plain().get("k0").await.expect("read"),
        Some(Bytes::from_static(b"fresh"))
    );
    assert_eq!(store.counters().gets(), before + 1);
}

#[tokio::test]
async fn failed_version_publish_releases_the_lock() {
    let store = InstrumentedStore::new(InMemoryStore::new());
    let cache = TaggableCache::with_config(
        store.clone(),
        TaggedCacheConfig::default().with_lock(LockConfig::default().with_retry_count(0)),
    )
    .expect("valid config");

    store.fail_sets(true);
    let err = cache
        .tags(["t"])
        .tags()
        .namespace()
        .await
        .expect_err("publish fails");
    assert!(matches!(err.root(), CacheError::Backend(message) if message == "write refused"));
    assert!(!store.inner().contains_key(&lock_resource("t")));
    assert!(!store.inner().contains_key(&tag_key("t")));

    // No retries are allowed, so a leftover lock would fail this call.
    store.fail_sets(false);
    let namespace = cache
        .tags(["t"])
        .tags()
        .namespace()
        .await
        .expect("namespace after recovery");
    assert_eq!(namespace.len(), 32);
    assert!(!store.inner().contains_key(&lock_resource("t")));
}

#[tokio::test]
async fn failed_reference_writes_fail_tagged_writes() {
    let store = InstrumentedStore::new(InMemoryStore::new());
    let cache = TaggableCache::new(store.clone());
    let view = cache.tags(["t"]);
    view.tags().namespace().await.expect("tag created");

    store.fail_sadds(true);
    let err = view
        .set("post", "body", None)
        .await
        .expect_err("reference write fails");
    assert!(matches!(err.root(), CacheError::Backend(message) if message == "write refused"));
    let err = view
        .increment("hits", 1)
        .await
        .expect_err("reference write fails");
    assert!(matches!(err.root(), CacheError::Backend(message) if message == "write refused"));

    store.fail_sadds(false);
    view.set("post", "body", None).await.expect("set");
    assert_eq!(view.list_keys().await.expect("list"), vec!["post".to_owned()]);
}
