//! Configuration for the tagging layer.

use std::time::Duration;

use crate::error::CacheError;
use crate::logging::EventLogConfig;

/// Retry and lifetime settings for the tag-version lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a held lock lives before the store expires it (default: 1s)
    pub ttl: Duration,
    /// Retries after the first failed attempt (default: 10)
    pub retry_count: u32,
    /// Fixed delay between attempts (default: 200ms)
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry (default: 200ms)
    pub retry_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(1000),
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
        }
    }
}

impl LockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.ttl.as_millis() == 0 {
            return Err(CacheError::InvalidConfig(
                "lock ttl must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings shared by every tagged view created from one
/// [`TaggableCache`](crate::TaggableCache).
#[derive(Debug, Clone)]
pub struct TaggedCacheConfig {
    /// Prefix of reference-set keys (default: `tags/`)
    pub tag_prefix: String,
    /// Expiry applied to tag version keys when they are resolved (default: none)
    pub tag_ttl: Option<Duration>,
    /// Keys deleted per command when flushing (default: 1000)
    pub delete_chunk_size: usize,
    /// Delete commands in flight at once when flushing (default: 100)
    pub delete_concurrency: usize,
    pub lock: LockConfig,
    pub events: EventLogConfig,
}

impl Default for TaggedCacheConfig {
    fn default() -> Self {
        Self {
            tag_prefix: "tags/".to_owned(),
            tag_ttl: None,
            delete_chunk_size: 1000,
            delete_concurrency: 100,
            lock: LockConfig::default(),
            events: EventLogConfig::default(),
        }
    }
}

impl TaggedCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    pub fn with_tag_ttl(mut self, ttl: Duration) -> Self {
        self.tag_ttl = Some(ttl);
        self
    }

    pub fn with_delete_chunk_size(mut self, size: usize) -> Self {
        self.delete_chunk_size = size;
        self
    }

    pub fn with_delete_concurrency(mut self, concurrency: usize) -> Self {
        self.delete_concurrency = concurrency;
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_events(mut self, events: EventLogConfig) -> Self {
        self.events = events;
        self
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.tag_prefix.is_empty() {
            return Err(CacheError::InvalidConfig(
                "tag_prefix must not be empty".to_owned(),
            ));
        }
        if self.delete_chunk_size == 0 {
            return Err(CacheError::InvalidConfig(
                "delete_chunk_size must be at least 1".to_owned(),
            ));
        }
        if self.delete_concurrency == 0 {
            return Err(CacheError::InvalidConfig(
                "delete_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.tag_ttl.is_some_and(|ttl| ttl.as_millis() == 0) {
            return Err(CacheError::InvalidConfig(
                "tag_ttl must be greater than zero".to_owned(),
            ));
        }
        self.lock.validate()
    }
}
