//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use redis_tagged_cache::prelude::*;
//! # async fn run() -> Result<(), CacheError> {
//! let cache = TaggableCache::new(InMemoryStore::new().with_key_prefix("app:"));
//! cache.tags(["user_1"]).set_ex("profile:1", 60, "...").await?;
//! # Ok(())
//! # }
//! ```

pub use crate::backend::memory::InMemoryStore;
#[cfg(feature = "redis-backend")]
pub use crate::backend::redis::RedisStore;
pub use crate::backend::{Expiry, ScanPage, TagStore};
pub use crate::coalesce::{Coalescer, Command, Reply};
pub use crate::codec::{BincodeCodec, CacheCodec, JsonCodec};
pub use crate::config::{LockConfig, TaggedCacheConfig};
pub use crate::error::CacheError;
pub use crate::lock::{DistributedLock, LockGuard, StoreLock};
pub use crate::logging::{EventLogConfig, TagEvent, TagEventType};
pub use crate::plain::PlainCache;
pub use crate::tag_set::TagSet;
pub use crate::tagged::TaggedCache;
pub use crate::TaggableCache;
