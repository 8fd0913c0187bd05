//! Request coalescing for idempotent store reads.
//!
//! A [`Coalescer`] sits in front of a [`TagStore`] and merges concurrent,
//! identical read commands into a single store round-trip. Every caller that
//! arrives while a command is outstanding receives a clone of the same
//! result (or the same error). The in-flight slot is released as soon as the
//! command settles, so a later call always reaches the store again.
//!
//! Only the commands in [`Command`] can be coalesced. Each of them is a pure
//! read; mutating commands must never go through this path.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::backend::{ScanPage, TagStore};
use crate::error::CacheError;

/// Idempotent store commands that may be coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// `GET key`
    Get { key: String },
    /// `SSCAN key cursor`
    Scan { key: String, cursor: u64 },
}

/// Reply to a coalesced [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Option<Bytes>),
    Page(ScanPage),
}

type SharedResult = Result<Reply, Arc<CacheError>>;
type SharedReply = Shared<BoxFuture<'static, SharedResult>>;

struct InFlight {
    id: u64,
    future: SharedReply,
}

/// Deduplicates concurrent identical reads against a store.
///
/// Cloning is cheap and shares the in-flight map, so one coalescer should be
/// created per store client and handed to everything that reads through it.
#[derive(Clone)]
pub struct Coalescer<S> {
    store: S,
    inflight: Arc<DashMap<Command, InFlight>>,
    next_id: Arc<AtomicU64>,
}

impl<S> Coalescer<S>
where
    S: TagStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            inflight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the store commands are issued against.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of commands currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Runs `command`, or joins an identical command that is already running.
    ///
    /// The store call runs on its own task, so it settles and frees its slot
    /// even when every caller stops waiting for it.
    pub async fn debounce(&self, command: Command) -> Result<Reply, CacheError> {
        let (future, pending) = match self.inflight.entry(command.clone()) {
            Entry::Occupied(occupied) => {
                #[cfg(feature = "metrics")]
                counter!("redis_tagged_cache.coalesce.joined").increment(1);

                (occupied.get().future.clone(), None)
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, receiver) = oneshot::channel();
                let inflight = self.inflight.clone();
                let key = command.clone();
                let future = receiver
                    .map(move |received| {
                        received.unwrap_or_else(|_| {
                            // The task died before replying.
                            inflight.remove_if(&key, |_, slot| slot.id == id);
                            Err(Arc::new(abandoned()))
                        })
                    })
                    .boxed()
                    .shared();
                vacant.insert(InFlight {
                    id,
                    future: future.clone(),
                });
                (future, Some((id, sender)))
            }
        };

        // Started only once the slot is visible and the map guard is gone.
        if let Some((id, sender)) = pending {
            self.spawn_command(id, command, sender);
        }

        future.await.map_err(CacheError::Coalesced)
    }

    /// Coalesced `GET`.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        match self.debounce(Command::Get { key: key.to_owned() }).await? {
            Reply::Value(value) => Ok(value),
            Reply::Page(_) => Err(unexpected_reply("GET")),
        }
    }

    /// Coalesced `SSCAN`.
    pub async fn sscan(&self, key: &str, cursor: u64) -> Result<ScanPage, CacheError> {
        let command = Command::Scan {
            key: key.to_owned(),
            cursor,
        };
        match self.debounce(command).await? {
            Reply::Page(page) => Ok(page),
            Reply::Value(_) => Err(unexpected_reply("SSCAN")),
        }
    }

    fn spawn_command(&self, id: u64, command: Command, sender: oneshot::Sender<SharedResult>) {
        let store = self.store.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            let result = match &command {
                Command::Get { key } => store.get(key).await.map(Reply::Value),
                Command::Scan { key, cursor } => store.sscan(key, *cursor).await.map(Reply::Page),
            };
            // Release the slot before any waiter observes the result.
            inflight.remove_if(&command, |_, slot| slot.id == id);
            // Every waiter may be gone already.
            let _ = sender.send(result.map_err(Arc::new));
        });
    }
}

fn abandoned() -> CacheError {
    CacheError::Backend("coalesced command ended without a reply".to_owned())
}

fn unexpected_reply(command: &str) -> CacheError {
    CacheError::Backend(format!("unexpected reply type for {command}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryStore;
    use crate::backend::Expiry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Store whose `get` blocks until released and counts invocations.
    #[derive(Clone)]
    struct GatedStore {
        inner: InMemoryStore,
        gets: Arc<AtomicUsize>,
        gate: Arc<Notify>,
        fail: bool,
    }

    impl GatedStore {
        fn new(fail: bool) -> Self {
            Self {
                inner: InMemoryStore::new(),
                gets: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(Notify::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl TagStore for GatedStore {
        fn key_prefix(&self) -> &str {
            ""
        }
        async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(CacheError::Backend("Boooh!".to_owned()));
            }
            self.inner.get(key).await
        }
        async fn set(&self, k: &str, v: Bytes, e: Option<Expiry>) -> Result<(), CacheError> {
            self.inner.set(k, v, e).await
        }
        async fn set_nx(&self, k: &str, v: Bytes, e: Option<Expiry>) -> Result<bool, CacheError> {
            self.inner.set_nx(k, v, e).await
        }
        async fn mset(&self, pairs: Vec<(String, Bytes)>) -> Result<(), CacheError> {
            self.inner.mset(pairs).await
        }
        async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
            self.inner.del(keys).await
        }
        async fn incr_by(&self, k: &str, d: i64) -> Result<i64, CacheError> {
            self.inner.incr_by(k, d).await
        }
        async fn sadd(&self, k: &str, m: &[String]) -> Result<u64, CacheError> {
            self.inner.sadd(k, m).await
        }
        async fn srem(&self, k: &str, m: &[String]) -> Result<u64, CacheError> {
            self.inner.srem(k, m).await
        }
        async fn sscan(&self, k: &str, c: u64) -> Result<ScanPage, CacheError> {
            self.inner.sscan(k, c).await
        }
        async fn pexpire(&self, k: &str, ms: i64) -> Result<bool, CacheError> {
            self.inner.pexpire(k, ms).await
        }
        async fn pttl(&self, k: &str) -> Result<i64, CacheError> {
            self.inner.pttl(k).await
        }
        async fn del_if_eq(&self, k: &str, v: &[u8]) -> Result<bool, CacheError> {
            self.inner.del_if_eq(k, v).await
        }
    }

    async fn wait_for_gets(store: &GatedStore, expected: usize) {
        while store.gets.load(Ordering::SeqCst) < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_identical_reads_share_one_call() {
        let store = GatedStore::new(false);
        store
            .inner
            .set("foo", Bytes::from_static(b"Completed"), None)
            .await
            .unwrap();
        let coalescer = Coalescer::new(store.clone());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move { coalescer.get("foo").await })
            })
            .collect();

        wait_for_gets(&store, 1).await;
        while coalescer.in_flight() != 1 {
            tokio::task::yield_now().await;
        }
        // Give the remaining callers a chance to join the outstanding call.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        store.gate.notify_one();

        for handle in handles {
            let value = handle.await.expect("task completes").expect("get succeeds");
            assert_eq!(value, Some(Bytes::from_static(b"Completed")));
        }
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter_and_clear_the_slot() {
        let store = GatedStore::new(true);
        let coalescer = Coalescer::new(store.clone());

        let first = tokio::spawn({
            let coalescer = coalescer.clone();
            async move { coalescer.get("foo").await }
        });
        wait_for_gets(&store, 1).await;
        let second = tokio::spawn({
            let coalescer = coalescer.clone();
            async move { coalescer.get("foo").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        store.gate.notify_one();

        let first = first.await.unwrap().expect_err("first fails");
        let second = second.await.unwrap().expect_err("second fails");
        match (&first, &second) {
            (CacheError::Coalesced(a), CacheError::Coalesced(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("unexpected errors: {other:?}"),
        }
        assert_eq!(first.root().to_string(), "backend error: Boooh!");
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settled_calls_are_not_reused() {
        let store = GatedStore::new(false);
        let coalescer = Coalescer::new(store.clone());

        store.gate.notify_one();
        assert_eq!(coalescer.get("foo").await.unwrap(), None);

        store
            .inner
            .set("foo", Bytes::from_static(b"bar"), None)
            .await
            .unwrap();
        store.gate.notify_one();
        assert_eq!(
            coalescer.get("foo").await.unwrap(),
            Some(Bytes::from_static(b"bar"))
        );
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_calls_still_release_their_slot() {
        let store = GatedStore::new(false);
        let coalescer = Coalescer::new(store.clone());

        let waited = tokio::time::timeout(Duration::from_millis(10), coalescer.get("foo")).await;
        assert!(waited.is_err());
        assert_eq!(coalescer.in_flight(), 1);

        store.gate.notify_one();
        while coalescer.in_flight() != 0 {
            tokio::task::yield_now().await;
        }

        store
            .inner
            .set("foo", Bytes::from_static(b"fresh"), None)
            .await
            .unwrap();
        store.gate.notify_one();
        assert_eq!(
            coalescer.get("foo").await.unwrap(),
            Some(Bytes::from_static(b"fresh"))
        );
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_commands_are_not_merged() {
        let store = InMemoryStore::new().with_scan_count(1);
        store
            .sadd("set", &["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        let coalescer = Coalescer::new(store);

        let (first, second) = tokio::join!(coalescer.sscan("set", 0), coalescer.sscan("set", 2));
        assert_eq!(first.unwrap().members, vec!["a".to_owned()]);
        assert_eq!(second.unwrap().members, vec!["b".to_owned()]);
    }
}
