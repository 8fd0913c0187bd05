use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::{Expiry, ScanPage, TagStore, TTL_MISSING, TTL_PERSISTENT};
use crate::error::CacheError;

const DEFAULT_SCAN_COUNT: usize = 10;

/// A process-local [`TagStore`] implementation.
///
/// The store is cheap to clone and shares a single keyspace. Expired keys are
/// dropped lazily on access. Set members remember their insertion order, so
/// an `sscan` cursor stays valid while members are removed mid-scan.
#[derive(Clone)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    key_prefix: String,
    scan_count: usize,
}

#[derive(Clone)]
struct StoredValue {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Clone)]
enum Data {
    Bytes(Bytes),
    Set(MemberSet),
}

/// Set members ordered by insertion sequence.
///
/// Sequence numbers start at 1 so that cursor `0` always means "from the
/// beginning" and "done".
#[derive(Clone, Default)]
struct MemberSet {
    by_seq: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
    next_seq: u64,
}

impl MemberSet {
    fn insert(&mut self, member: &str) -> bool {
        if self.seq_of.contains_key(member) {
            return false;
        }
        self.next_seq += 1;
        self.by_seq.insert(self.next_seq, member.to_owned());
        self.seq_of.insert(member.to_owned(), self.next_seq);
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.seq_of.remove(member) {
            Some(seq) => {
                self.by_seq.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    fn page(&self, cursor: u64, count: usize) -> ScanPage {
        let mut iter = self.by_seq.range(cursor.max(1)..);
        let members: Vec<(u64, String)> = iter
            .by_ref()
            .take(count)
            .map(|(seq, member)| (*seq, member.clone()))
            .collect();
        let cursor = match (members.last(), iter.next()) {
            (Some((last, _)), Some(_)) => last + 1,
            _ => 0,
        };
        ScanPage {
            cursor,
            members: members.into_iter().map(|(_, member)| member).collect(),
        }
    }
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!(
        "WRONGTYPE operation against key `{key}` holding the wrong kind of value"
    ))
}

fn expires_at(expiry: Option<Expiry>) -> Option<Instant> {
    expiry.map(|expiry| Instant::now() + expiry.as_duration())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            key_prefix: String::new(),
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Prepends `prefix` to every key this store touches.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the maximum number of members returned per `sscan` page.
    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }

    /// Number of live keys, expired ones excluded.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether `key` (unprefixed) exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(&self.make_key(key))
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Drops every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Runs `f` on the live value stored under `key`, dropping it first if
    /// it has expired.
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&StoredValue>) -> T) -> T {
        let now = Instant::now();
        let full_key = self.make_key(key);
        self.entries.remove_if(&full_key, |_, value| value.is_expired(now));
        let entry = self.entries.get(&full_key);
        f(entry.as_deref())
    }

    fn set_members<F, T>(&self, key: &str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut MemberSet) -> T,
    {
        let now = Instant::now();
        match self.entries.entry(self.make_key(key)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue {
                        data: Data::Set(MemberSet::default()),
                        expires_at: None,
                    });
                }
                let result = match &mut occupied.get_mut().data {
                    Data::Set(set) => f(set),
                    Data::Bytes(_) => return Err(wrong_type(key)),
                };
                if matches!(&occupied.get().data, Data::Set(set) if set.is_empty()) {
                    occupied.remove();
                }
                Ok(result)
            }
            Entry::Vacant(vacant) => {
                let mut set = MemberSet::default();
                let result = f(&mut set);
                if !set.is_empty() {
                    vacant.insert(StoredValue {
                        data: Data::Set(set),
                        expires_at: None,
                    });
                }
                Ok(result)
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TagStore for InMemoryStore {
    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.with_live(key, |value| match value {
            Some(StoredValue {
                data: Data::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<(), CacheError> {
        let expiry = Expiry::validate(expiry)?;
        self.entries.insert(
            self.make_key(key),
            StoredValue {
                data: Data::Bytes(value),
                expires_at: expires_at(expiry),
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Bytes,
        expiry: Option<Expiry>,
    ) -> Result<bool, CacheError> {
        let expiry = Expiry::validate(expiry)?;
        let now = Instant::now();
        let stored = StoredValue {
            data: Data::Bytes(value),
            expires_at: expires_at(expiry),
        };
        match self.entries.entry(self.make_key(key)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
                Ok(true)
            }
        }
    }

    async fn mset(&self, pairs: Vec<(String, Bytes)>) -> Result<(), CacheError> {
        for (key, value) in pairs {
            self.entries.insert(
                self.make_key(&key),
                StoredValue {
                    data: Data::Bytes(value),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| self.entries.remove(&self.make_key(key)))
            .filter(|(_, value)| !value.is_expired(now))
            .count();
        Ok(removed as u64)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(self.make_key(key))
            .or_insert_with(|| StoredValue {
                data: Data::Bytes(Bytes::from_static(b"0")),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = StoredValue {
                data: Data::Bytes(Bytes::from_static(b"0")),
                expires_at: None,
            };
        }
        let current = match &entry.data {
            Data::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| {
                    CacheError::Backend("value is not an integer or out of range".to_owned())
                })?,
            Data::Set(_) => return Err(wrong_type(key)),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Backend("increment would overflow".to_owned()))?;
        entry.data = Data::Bytes(Bytes::from(next.to_string()));
        Ok(next)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        self.set_members(key, |set| {
            members.iter().filter(|member| set.insert(member)).count() as u64
        })
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        self.set_members(key, |set| {
            members.iter().filter(|member| set.remove(member)).count() as u64
        })
    }

    async fn sscan(&self, key: &str, cursor: u64) -> Result<ScanPage, CacheError> {
        let count = self.scan_count;
        self.with_live(key, |value| match value {
            Some(StoredValue {
                data: Data::Set(set),
                ..
            }) => Ok(set.page(cursor, count)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(ScanPage::default()),
        })
    }

    async fn pexpire(&self, key: &str, millis: i64) -> Result<bool, CacheError> {
        let now = Instant::now();
        let full_key = self.make_key(key);
        if millis <= 0 {
            let removed = self
                .entries
                .remove(&full_key)
                .is_some_and(|(_, value)| !value.is_expired(now));
            return Ok(removed);
        }
        match self.entries.get_mut(&full_key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + Duration::from_millis(millis as u64));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        let now = Instant::now();
        Ok(self.with_live(key, |value| match value {
            Some(StoredValue {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(now).as_millis() as i64,
            Some(_) => TTL_PERSISTENT,
            None => TTL_MISSING,
        }))
    }

    async fn del_if_eq(&self, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let now = Instant::now();
        let removed = self.entries.remove_if(&self.make_key(key), |_, stored| {
            !stored.is_expired(now)
                && matches!(&stored.data, Data::Bytes(bytes) if bytes.as_ref() == value)
        });
        Ok(removed.is_some())
    }
}
