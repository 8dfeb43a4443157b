//! Multi-Tier Caching Engine
//!
//! A two-tier cache for application data:
//! - **Local**: in-process, bounded by bytes and item count, LRU eviction
//! - **Remote**: shared key-value service reached through a circuit breaker
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             TieredCache                                  │
//! │   get / set / delete / invalidate / get_or_compute / warm / preload      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐   │
//! │  │ StrategyRegistry │  │      Codec       │  │    CacheMetrics      │   │
//! │  │ (named options)  │  │ JSON + lz4/zstd/ │  │ (cache-line aligned) │   │
//! │  │                  │  │      snappy      │  │                      │   │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐        ┌──────────────────────────────┐   │
//! │  │       LocalTier          │ promote│         RemoteTier           │   │
//! │  │  (IndexMap LRU, bytes +  │◄───────│  envelope + tag/dep indexes  │   │
//! │  │   item limits, TTL)      │        │  timeout + CircuitBreaker    │   │
//! │  └──────────────────────────┘        └──────────────┬───────────────┘   │
//! │                                                     │                    │
//! │                                       ┌─────────────┴──────────────┐    │
//! │                                       │   RemoteStore (trait)      │    │
//! │                                       │   memory | redis           │    │
//! │                                       └────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  BackgroundMaintainer: expiry sweep • metrics snapshots • refresh-ahead │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use smart_cache::cache::{CacheOptions, InvalidationRequest, MemoryRemoteStore, TieredCache, TieredCacheConfig};
//! use std::sync::Arc;
//!
//! let cache = TieredCache::new(TieredCacheConfig::default(), Arc::new(MemoryRemoteStore::new()))?;
//!
//! cache.set("product:1", &product, &CacheOptions::with_strategy("catalog")).await?;
//! let cached: Option<Product> = cache.get("product:1", &CacheOptions::new()).await;
//!
//! let fresh: Product = cache
//!     .get_or_compute("product:2", &CacheOptions::new().ttl(60), || load_product(2))
//!     .await?;
//!
//! cache.invalidate(&InvalidationRequest::pattern("product:*")).await?;
//! println!("Hit ratio: {:.2}%", cache.metrics().hit_ratio * 100.0);
//! ```

pub mod circuit;
pub mod codec;
pub mod entry;
pub mod events;
pub mod local;
pub mod maintenance;
pub mod manager;
pub mod metrics;
pub mod remote;
pub mod strategy;
pub mod tier;

// Re-export main types
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use codec::{Codec, CompressionAlgorithm, CompressionConfig, Compressor};
pub use entry::{CacheEntry, EntryMetadata, RemoteEntry};
pub use events::{CacheEvent, EvictionReason};
pub use local::{LocalTier, LocalTierConfig, LocalTierStats};
pub use maintenance::{BackgroundMaintainer, MaintenanceConfig, MaintenanceHandle};
pub use manager::{
    value_factory, HealthStatus, InvalidationRequest, TieredCache, TieredCacheConfig,
    ValueFactory, WarmEntry, WarmFailure, WarmReport,
};
pub use metrics::{CacheMetrics, CacheTierMetrics, MetricsExporter, MetricsSnapshot, TierMetricsSnapshot};
pub use remote::{MemoryRemoteStore, RemoteStore, RemoteTier, SharedRemoteStore};
#[cfg(feature = "redis-store")]
pub use remote::RedisRemoteStore;
pub use strategy::{CacheOptions, CacheStrategy, EngineDefaults, ResolvedOptions, StrategyRegistry};
pub use tier::{CacheTier, TierSelection};
