//! Smart Cache - Multi-Tier Cache Engine
//!
//! An in-process local tier in front of a shared remote key-value store,
//! with named caching strategies, threshold-driven compression, tag and
//! dependency invalidation, stampede protection, and a circuit breaker that
//! keeps reads fast while the remote store is down.
//!
//! # Modules
//!
//! - [`cache`]: Tiers, codec, strategies, orchestration and maintenance
//! - [`error`]: Error types and handling

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    BackgroundMaintainer, CacheEvent, CacheOptions, CacheStrategy, CacheTier, CircuitState,
    CompressionAlgorithm, InvalidationRequest, MemoryRemoteStore, MetricsExporter,
    MetricsSnapshot, RemoteStore, StrategyRegistry, TierSelection, TieredCache,
    TieredCacheConfig, WarmEntry,
};

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
