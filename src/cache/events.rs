//! Cache Events
//!
//! Fire-and-forget events broadcast by the cache for monitoring and
//! observability. Sending never blocks an operation; slow subscribers
//! lag and drop events.

use crate::cache::circuit::CircuitState;
use crate::cache::metrics::MetricsSnapshot;
use crate::cache::tier::CacheTier;
use serde::Serialize;

/// Events emitted by the cache
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Entry was stored in a tier
    Set {
        key: String,
        tier: CacheTier,
        size_bytes: u64,
        compressed: bool,
    },

    /// Lookup answered by a tier
    Hit { key: String, tier: CacheTier },

    /// Lookup answered by no tier
    Miss { key: String },

    /// Entry was deleted from a tier
    Delete { key: String, tier: CacheTier },

    /// Entry was removed from the local tier to make room or because it expired
    Evict {
        key: String,
        size_bytes: u64,
        reason: EvictionReason,
    },

    /// Remote hit copied into the local tier
    Promote { key: String, ttl_secs: u64 },

    /// Bulk invalidation finished
    Invalidation {
        pattern: Option<String>,
        tags: Vec<String>,
        dependencies: Vec<String>,
        removed: u64,
    },

    /// An operation failed or degraded
    Error {
        key: Option<String>,
        operation: String,
        error: String,
    },

    /// Remote circuit breaker changed state
    CircuitStateChanged { from: CircuitState, to: CircuitState },

    /// Periodic metrics snapshot from the background maintainer
    StatsSnapshot(Box<MetricsSnapshot>),
}

/// Reason for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Capacity limit reached
    Capacity,
    /// Entry expired (TTL)
    Expired,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::Expired => write!(f, "expired"),
        }
    }
}

impl CacheEvent {
    /// Create a Set event
    pub fn set(key: &str, tier: CacheTier, size_bytes: u64, compressed: bool) -> Self {
        CacheEvent::Set {
            key: key.to_string(),
            tier,
            size_bytes,
            compressed,
        }
    }

    /// Create a Hit event
    pub fn hit(key: &str, tier: CacheTier) -> Self {
        CacheEvent::Hit {
            key: key.to_string(),
            tier,
        }
    }

    /// Create a Miss event
    pub fn miss(key: &str) -> Self {
        CacheEvent::Miss {
            key: key.to_string(),
        }
    }

    /// Create a Delete event
    pub fn delete(key: &str, tier: CacheTier) -> Self {
        CacheEvent::Delete {
            key: key.to_string(),
            tier,
        }
    }

    /// Create an Evict event
    pub fn evict(key: &str, size_bytes: u64, reason: EvictionReason) -> Self {
        CacheEvent::Evict {
            key: key.to_string(),
            size_bytes,
            reason,
        }
    }

    /// Create an Error event
    pub fn error(key: Option<&str>, operation: &str, error: impl ToString) -> Self {
        CacheEvent::Error {
            key: key.map(str::to_string),
            operation: operation.to_string(),
            error: error.to_string(),
        }
    }

    /// Get the key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Set { key, .. }
            | CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key }
            | CacheEvent::Delete { key, .. }
            | CacheEvent::Evict { key, .. }
            | CacheEvent::Promote { key, .. } => Some(key),
            CacheEvent::Error { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    /// Get the tier associated with this event (if any)
    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            CacheEvent::Set { tier, .. }
            | CacheEvent::Hit { tier, .. }
            | CacheEvent::Delete { tier, .. } => Some(*tier),
            CacheEvent::Evict { .. } | CacheEvent::Promote { .. } => Some(CacheTier::Local),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(self, CacheEvent::Error { .. })
    }
}
