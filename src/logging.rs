//! Structured logging for tag lifecycle events.
//!
//! Version rotations, flushes and tag-scoped deletions are the operations
//! worth auditing in a tagged cache: they silently orphan or remove many
//! entries at once. When enabled, each of them emits a single JSON record
//! through `tracing` so the records can be shipped and correlated with the
//! rest of an application's logs.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};

/// Configuration for structured tag event logging.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Enable structured event logging
    pub enabled: bool,

    /// Hash tag names before logging (recommended when tags carry user ids)
    pub hash_tags: bool,

    /// Target recorded in each event (defaults to "redis_tagged_cache::events")
    pub target: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hash_tags: false,
            target: "redis_tagged_cache::events".to_string(),
        }
    }
}

impl EventLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_hash_tags(mut self, hash: bool) -> Self {
        self.hash_tags = hash;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

/// Kinds of tag events that can be logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagEventType {
    /// A tag received its first version
    VersionCreated,
    /// One or more tag versions were rotated
    Reset,
    /// Entries and reference sets of a tag set were flushed
    Flush,
    /// Intersected entries were deleted
    DeleteWithTags,
    /// Reference sets were drained page by page
    BatchDelete,
    /// Intersected entries were marked for expiry
    Invalidate,
    /// Dangling references were removed
    Prune,
}

/// A single structured tag event.
#[derive(Debug, Clone)]
pub struct TagEvent {
    pub timestamp: SystemTime,
    pub event_type: TagEventType,
    pub tags: Vec<String>,
    /// Number of cache entries touched, when known
    pub keys_affected: Option<usize>,
    pub latency_us: Option<u64>,
    pub metadata: serde_json::Value,
}

impl TagEvent {
    pub fn new(event_type: TagEventType, tags: Vec<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            tags,
            keys_affected: None,
            latency_us: None,
            metadata: json!({}),
        }
    }

    pub fn with_keys_affected(mut self, count: usize) -> Self {
        self.keys_affected = Some(count);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(latency.as_micros() as u64);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Renders the event as the JSON record that [`TagEvent::log`] emits.
    pub fn to_json(&self, config: &EventLogConfig) -> serde_json::Value {
        let tags: Vec<String> = if config.hash_tags {
            self.tags.iter().map(|tag| hash_tag(tag)).collect()
        } else {
            self.tags.clone()
        };

        let timestamp_ms = self
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        json!({
            "timestamp_ms": timestamp_ms,
            "target": config.target,
            "event": self.event_type,
            "tags": tags,
            "keys_affected": self.keys_affected,
            "latency_us": self.latency_us,
            "metadata": self.metadata,
        })
    }

    /// Logs this event using the provided configuration.
    pub fn log(&self, config: &EventLogConfig) {
        if !config.enabled {
            return;
        }

        let _record = self.to_json(config);

        #[cfg(feature = "tracing")]
        tracing::info!(target: "redis_tagged_cache::events", event = %_record);
    }
}

/// Hashes a tag name using SHA-256.
pub fn hash_tag(tag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hex::encode(hasher.finalize())
}
