//! Cache Entry Types
//!
//! Defines local-tier entries, the metadata that travels with remote
//! entries, and the compression algorithm identifier.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Version of the remote envelope header layout
pub const SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
    Zstd,
    Snappy,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

// =============================================================================
// Expiry helpers
// =============================================================================

/// Longest TTL honoured (100 years); larger values are clamped
pub const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

fn expires_at(created_at: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    let ttl = ChronoDuration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64);
    created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining(created_at: DateTime<Utc>, ttl_secs: u64, now: DateTime<Utc>) -> Duration {
    expires_at(created_at, ttl_secs)
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn consumed(ttl_secs: u64, left: Duration) -> f64 {
    if ttl_secs == 0 {
        return 1.0;
    }
    let total = ttl_secs.min(MAX_TTL_SECS) as f64;
    ((total - left.as_secs_f64()) / total).clamp(0.0, 1.0)
}

// =============================================================================
// Local Cache Entry
// =============================================================================

/// An entry held by the local tier, always in decoded form
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Unique key for this entry
    pub key: String,
    /// The decoded value
    pub value: Arc<Value>,
    /// Lifetime from creation
    pub ttl_secs: u64,
    /// Time when entry was created/cached
    pub created_at: DateTime<Utc>,
    /// Time when entry was last accessed
    pub last_accessed: DateTime<Utc>,
    /// Number of times this entry has been read
    pub access_count: u64,
    /// Encoded size, used for capacity accounting
    pub size_bytes: u64,
    /// Labels for group invalidation
    pub tags: BTreeSet<String>,
    /// Upstream data this entry is derived from
    pub dependencies: BTreeSet<String>,
}

impl CacheEntry {
    /// Create a new cache entry
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Arc<Value>>,
        size_bytes: u64,
        ttl_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value: value.into(),
            ttl_secs,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size_bytes,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
        }
    }

    /// Attach tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Attach dependencies
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Record an access to this entry
    pub fn record_access(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against an explicit clock reading
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= expires_at(self.created_at, self.ttl_secs)
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self) -> Duration {
        remaining(self.created_at, self.ttl_secs, Utc::now())
    }

    /// Fraction of the TTL already consumed (0.0 to 1.0)
    pub fn ttl_consumed(&self) -> f64 {
        consumed(self.ttl_secs, self.remaining_ttl())
    }

    /// Check if the entry carries any of `tags`
    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }

    /// Check if the entry depends on any of `deps`
    pub fn has_any_dependency(&self, deps: &BTreeSet<String>) -> bool {
        !self.dependencies.is_disjoint(deps)
    }
}

// =============================================================================
// Remote Entry Metadata
// =============================================================================

/// Metadata stored alongside every remote payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Whether the payload is compressed
    pub compressed: bool,
    /// Algorithm used when compressed
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
    /// Size of the encoded value before compression
    pub original_size: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub schema_version: u32,
}

impl EntryMetadata {
    /// Create metadata for a freshly written entry
    pub fn new(ttl_secs: u64, original_size: u64) -> Self {
        Self {
            compressed: false,
            algorithm: CompressionAlgorithm::None,
            original_size,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            created_at: Utc::now(),
            ttl_secs,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Time left before the remote entry expires
    pub fn remaining_ttl(&self) -> Duration {
        remaining(self.created_at, self.ttl_secs, Utc::now())
    }

    /// Check if the remote entry has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= expires_at(self.created_at, self.ttl_secs)
    }

    /// Fraction of the TTL already consumed (0.0 to 1.0)
    pub fn ttl_consumed(&self) -> f64 {
        consumed(self.ttl_secs, self.remaining_ttl())
    }
}

/// A payload read back from the remote tier
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Encoded bytes, possibly compressed
    pub bytes: Bytes,
    pub metadata: EntryMetadata,
}

impl RemoteEntry {
    /// Get the stored size in bytes
    pub fn stored_size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
