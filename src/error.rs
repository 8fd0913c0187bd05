use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while interacting with the tagged cache or its store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "redis-backend")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// The distributed lock could not be acquired within the retry budget.
    #[error("could not acquire lock on `{resource}` after {attempts} attempts")]
    LockUnavailable { resource: String, attempts: u32 },

    /// Failure of a coalesced call, shared by every caller that waited on it.
    #[error(transparent)]
    Coalesced(Arc<CacheError>),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Returns the underlying error, looking through coalesced wrappers.
    pub fn root(&self) -> &CacheError {
        match self {
            CacheError::Coalesced(inner) => inner.root(),
            other => other,
        }
    }

    /// Returns `true` when the error came from lock contention exhaustion.
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self.root(), CacheError::LockUnavailable { .. })
    }
}
