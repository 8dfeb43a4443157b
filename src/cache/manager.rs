//! Tiered Cache Manager
//!
//! [`TieredCache`] is the public entry point. It resolves per-call options
//! against the strategy registry, serves reads from the local tier and then
//! the remote tier (promoting remote hits), writes to the selected tiers,
//! and runs invalidation, cache-aside computation and bulk warming.
//!
//! Reads never fail for infrastructure reasons: an unreachable remote
//! store, an open circuit or a corrupt payload all degrade to a miss.
//! Writes fail only when every selected tier failed.

use crate::cache::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::cache::codec::{Codec, CompressionConfig};
use crate::cache::entry::{CacheEntry, EntryMetadata};
use crate::cache::events::{CacheEvent, EvictionReason};
use crate::cache::local::{EvictedEntry, LocalLookup, LocalTier, LocalTierConfig, LocalTierStats};
use crate::cache::maintenance::MaintenanceConfig;
use crate::cache::metrics::{CacheMetrics, MetricsSnapshot};
use crate::cache::remote::{RemoteTier, SharedRemoteStore};
use crate::cache::strategy::{CacheOptions, EngineDefaults, ResolvedOptions, StrategyRegistry};
use crate::cache::tier::{CacheTier, TierSelection};
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the tiered cache
#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    /// Local tier capacity limits
    pub local: LocalTierConfig,
    /// Compression configuration
    pub compression: CompressionConfig,
    /// Remote circuit breaker configuration
    pub circuit: CircuitBreakerConfig,
    /// TTL used when neither the call nor a strategy sets one
    pub default_ttl_secs: u64,
    /// Tier selection used when neither the call nor a strategy sets one
    pub default_tier: TierSelection,
    /// Deadline for each remote call unless the call sets its own
    pub remote_timeout: Duration,
    /// Coalesce concurrent `get_or_compute` misses for the same key
    pub single_flight: bool,
    /// Factories run concurrently by `warm`
    pub warm_concurrency: usize,
    /// Event channel capacity
    pub event_channel_capacity: usize,
    /// Background maintainer schedule
    pub maintenance: MaintenanceConfig,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            compression: CompressionConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            default_ttl_secs: 300,
            default_tier: TierSelection::Both,
            remote_timeout: Duration::from_secs(2),
            single_flight: true,
            warm_concurrency: 8,
            event_channel_capacity: 1024,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl TieredCacheConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.local.max_size_bytes == 0, "local.max_size_bytes must be positive"),
            (self.local.max_items == 0, "local.max_items must be positive"),
            (self.circuit.failure_threshold == 0, "circuit.failure_threshold must be positive"),
            (self.default_ttl_secs == 0, "default_ttl_secs must be positive"),
            (self.remote_timeout.is_zero(), "remote_timeout must be positive"),
            (self.warm_concurrency == 0, "warm_concurrency must be positive"),
            (self.event_channel_capacity == 0, "event_channel_capacity must be positive"),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(Error::Configuration(message.to_string()));
        }
        self.maintenance.validate()
    }

    fn engine_defaults(&self) -> EngineDefaults {
        EngineDefaults {
            ttl_secs: self.default_ttl_secs,
            tier: self.default_tier,
            compress: true,
            timeout: self.remote_timeout,
        }
    }
}

// =============================================================================
// Request / Report Types
// =============================================================================

/// Bulk invalidation selector; every set field is applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    /// Glob over keys (`*`, `?`, `[...]`)
    pub pattern: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl InvalidationRequest {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_tags(tags)
    }

    pub fn dependencies<I, S>(deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_dependencies(deps)
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.tags.is_empty() && self.dependencies.is_empty()
    }
}

/// Reusable, type-erased value producer for warming and background refresh
pub type ValueFactory = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap a typed async closure as a [`ValueFactory`]
pub fn value_factory<F, Fut, T>(factory: F) -> ValueFactory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    Arc::new(move || {
        let pending = factory();
        async move {
            let value = pending.await?;
            Ok(serde_json::to_value(value)?)
        }
        .boxed()
    })
}

/// One entry for [`TieredCache::warm`]
#[derive(Clone)]
pub struct WarmEntry {
    pub key: String,
    pub options: CacheOptions,
    pub factory: ValueFactory,
}

impl WarmEntry {
    pub fn new(key: impl Into<String>, options: CacheOptions, factory: ValueFactory) -> Self {
        Self {
            key: key.into(),
            options,
            factory,
        }
    }
}

impl std::fmt::Debug for WarmEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmEntry")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A warm entry that could not be stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of a warm, preload or refresh batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarmReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<WarmFailure>,
}

/// Result of [`TieredCache::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// The cache can serve requests (the local tier is always available)
    pub healthy: bool,
    pub local_ok: bool,
    /// The remote store answered a probe
    pub remote_ok: bool,
    pub remote_backend: &'static str,
    pub circuit_state: CircuitState,
}

struct RefreshRegistration {
    options: CacheOptions,
    factory: ValueFactory,
}

// =============================================================================
// Tiered Cache
// =============================================================================

/// Two-tier cache engine
pub struct TieredCache {
    /// In-process tier
    local: LocalTier,
    /// Remote tier behind the circuit breaker
    remote: RemoteTier,
    /// Serialization and compression
    codec: Codec,
    /// Named strategies
    strategies: StrategyRegistry,
    /// Metrics
    metrics: CacheMetrics,
    /// Fallbacks for option resolution
    defaults: EngineDefaults,
    /// Configuration
    config: TieredCacheConfig,
    /// Event broadcaster
    event_tx: broadcast::Sender<CacheEvent>,
    /// Per-key locks for coalesced computation
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Keys kept fresh by the background maintainer
    refreshers: DashMap<String, RefreshRegistration>,
}

impl TieredCache {
    /// Create a cache over `store` with the built-in strategy catalog
    pub fn new(config: TieredCacheConfig, store: SharedRemoteStore) -> Result<Arc<Self>> {
        Self::with_strategies(config, store, StrategyRegistry::with_defaults())
    }

    /// Create a cache with an explicit strategy registry
    pub fn with_strategies(
        config: TieredCacheConfig,
        store: SharedRemoteStore,
        strategies: StrategyRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);

        let breaker_tx = event_tx.clone();
        let breaker = CircuitBreaker::new(config.circuit.clone()).with_listener(Box::new(
            move |from: CircuitState, to: CircuitState| {
                let _ = breaker_tx.send(CacheEvent::CircuitStateChanged { from, to });
            },
        ));

        let backend = store.name();
        let cache = Arc::new(Self {
            local: LocalTier::new(config.local.clone()),
            remote: RemoteTier::new(store, Arc::new(breaker)),
            codec: Codec::with_config(config.compression.clone()),
            strategies,
            metrics: CacheMetrics::new(),
            defaults: config.engine_defaults(),
            config,
            event_tx,
            in_flight: DashMap::new(),
            refreshers: DashMap::new(),
        });

        info!(
            remote = backend,
            max_local_bytes = cache.config.local.max_size_bytes,
            max_local_items = cache.config.local.max_items,
            strategies = cache.strategies.len(),
            "Tiered cache initialized"
        );
        Ok(cache)
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    /// Emit a cache event
    pub(crate) fn emit_event(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    fn resolve(&self, options: &CacheOptions) -> ResolvedOptions {
        self.strategies.resolve(options, &self.defaults)
    }

    fn record_failure(&self, tier: Option<CacheTier>, key: Option<&str>, operation: &str, error: &Error) {
        if let Some(tier) = tier {
            self.metrics.tier(tier).record_error();
        }
        self.metrics.overall.record_error();
        self.emit_event(CacheEvent::error(key, operation, error));
    }

    fn record_evictions(&self, evicted: Vec<EvictedEntry>) {
        if evicted.is_empty() {
            return;
        }
        let count = evicted.len() as u64;
        self.metrics.local.record_evictions(count);
        self.metrics.overall.record_evictions(count);
        for victim in evicted {
            debug!(key = %victim.key, size = victim.size_bytes, "Evicted local entry");
            self.emit_event(CacheEvent::evict(&victim.key, victim.size_bytes, EvictionReason::Capacity));
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Get a value, or `None` when no selected tier holds a live copy
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        let started = Instant::now();
        let resolved = self.resolve(options);
        let value = self.get_typed(key, &resolved).await;
        self.metrics.response_times.record(started.elapsed());
        value
    }

    async fn get_typed<T: DeserializeOwned>(&self, key: &str, resolved: &ResolvedOptions) -> Option<T> {
        let found = match self.lookup(key, resolved).await {
            Some(value) => match self.codec.from_value(key, &value) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached value has an unexpected shape, treating as miss");
                    self.record_failure(None, Some(key), "get", &e);
                    None
                }
            },
            None => None,
        };

        if found.is_some() {
            self.metrics.overall.record_hit();
        } else {
            self.metrics.overall.record_miss();
            self.emit_event(CacheEvent::miss(key));
        }
        found
    }

    /// Local tier, then remote tier; first hit wins
    async fn lookup(&self, key: &str, resolved: &ResolvedOptions) -> Option<Arc<Value>> {
        if resolved.tier.includes_local() {
            match self.local.get(key) {
                LocalLookup::Hit(value) => {
                    self.metrics.local.record_hit();
                    self.emit_event(CacheEvent::hit(key, CacheTier::Local));
                    debug!(key = %key, tier = %CacheTier::Local, "Cache hit");
                    return Some(value);
                }
                LocalLookup::Expired => {
                    self.metrics.local.record_miss();
                    self.emit_event(CacheEvent::evict(key, 0, EvictionReason::Expired));
                }
                LocalLookup::Miss => self.metrics.local.record_miss(),
            }
        }

        if !resolved.tier.includes_remote() {
            return None;
        }

        let entry = match self.remote.get(key, resolved.timeout).await {
            Ok(Some(entry)) if !entry.metadata.is_expired() => entry,
            Ok(_) => {
                self.metrics.remote.record_miss();
                return None;
            }
            Err(Error::CircuitOpen) => {
                debug!(key = %key, "Circuit open, skipping remote tier");
                self.metrics.remote.record_miss();
                return None;
            }
            Err(e) if e.is_corrupt_payload() => {
                self.discard_corrupt(key, resolved.timeout, &e).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Remote lookup failed, treating as miss");
                self.record_failure(Some(CacheTier::Remote), Some(key), "get", &e);
                return None;
            }
        };

        let value = match self
            .codec
            .decode_from_storage(key, &entry.bytes, &entry.metadata)
        {
            Ok(value) => Arc::new(value),
            Err(e) => {
                self.discard_corrupt(key, resolved.timeout, &e).await;
                return None;
            }
        };

        self.metrics.remote.record_hit();
        self.emit_event(CacheEvent::hit(key, CacheTier::Remote));
        debug!(key = %key, tier = %CacheTier::Remote, "Cache hit");

        if resolved.tier.includes_local() {
            self.promote(key, &value, &entry.metadata, resolved);
        }
        Some(value)
    }

    /// Copy a remote hit into the local tier for the rest of its remote lifetime
    fn promote(&self, key: &str, value: &Arc<Value>, metadata: &EntryMetadata, resolved: &ResolvedOptions) {
        let remaining = metadata.remaining_ttl();
        let remaining_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        let ttl_secs = remaining_secs.min(resolved.ttl_secs);
        if ttl_secs == 0 {
            return;
        }

        let entry = CacheEntry::new(key, Arc::clone(value), metadata.original_size, ttl_secs)
            .with_tags(metadata.tags.iter().cloned())
            .with_dependencies(metadata.dependencies.iter().cloned());

        match self.local.set(entry) {
            Ok(evicted) => {
                self.record_evictions(evicted);
                self.emit_event(CacheEvent::Promote {
                    key: key.to_string(),
                    ttl_secs,
                });
                debug!(key = %key, ttl_secs, "Promoted remote entry to local tier");
            }
            Err(e) => debug!(key = %key, error = %e, "Skipped promotion"),
        }
    }

    async fn discard_corrupt(&self, key: &str, timeout: Duration, error: &Error) {
        warn!(key = %key, error = %error, "Discarding unreadable remote entry");
        self.record_failure(Some(CacheTier::Remote), Some(key), "decode", error);
        if let Err(e) = self.remote.delete(key, timeout).await {
            debug!(key = %key, error = %e, "Failed to delete unreadable remote entry");
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store a value in the selected tiers
    ///
    /// Fails only when every selected tier failed. A value too large for the
    /// local tier is written to the remote tier alone when both are
    /// selected.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: &CacheOptions) -> Result<()> {
        let started = Instant::now();
        let resolved = self.resolve(options);
        let result = self.store(key, value, &resolved).await;
        self.metrics.response_times.record(started.elapsed());
        result
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, resolved: &ResolvedOptions) -> Result<()> {
        if resolved.ttl_secs == 0 {
            return Err(Error::Configuration(format!("ttl for key {} must be positive", key)));
        }

        let encoded = match self.codec.encode_for_storage(key, value, resolved.compress) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.record_failure(None, Some(key), "set", &e);
                return Err(e);
            }
        };
        self.metrics.overall.record_set();

        let local_result = resolved.tier.includes_local().then(|| {
            let entry = CacheEntry::new(key, encoded.value.clone(), encoded.encoded_size, resolved.ttl_secs)
                .with_tags(resolved.tags.iter().cloned())
                .with_dependencies(resolved.dependencies.iter().cloned());

            match self.local.set(entry) {
                Ok(evicted) => {
                    self.record_evictions(evicted);
                    self.metrics.local.record_set();
                    self.emit_event(CacheEvent::set(key, CacheTier::Local, encoded.encoded_size, false));
                    Ok(())
                }
                Err(e) => {
                    // Never leave an older copy behind
                    self.local.delete(key);
                    debug!(key = %key, error = %e, "Local write rejected");
                    Err(e)
                }
            }
        });

        let remote_result = if resolved.tier.includes_remote() {
            let mut metadata = EntryMetadata::new(resolved.ttl_secs, encoded.encoded_size);
            metadata.compressed = encoded.is_compressed();
            metadata.algorithm = encoded.algorithm;
            metadata.tags = resolved.tags.clone();
            metadata.dependencies = resolved.dependencies.clone();

            let stored_size = encoded.bytes.len() as u64;
            let result = self
                .remote
                .set_with_ttl(key, encoded.bytes.clone(), metadata, resolved.ttl_secs, resolved.timeout)
                .await
                .map_err(|e| match e {
                    Error::CircuitOpen => Error::RemoteUnavailable("circuit breaker open".to_string()),
                    other => other,
                });

            match &result {
                Ok(()) => {
                    self.metrics.remote.record_set();
                    self.emit_event(CacheEvent::set(key, CacheTier::Remote, stored_size, encoded.is_compressed()));
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Remote write failed");
                    self.record_failure(Some(CacheTier::Remote), Some(key), "set", e);
                }
            }
            Some(result)
        } else {
            None
        };

        debug!(
            key = %key,
            tier = %resolved.tier,
            size = encoded.encoded_size,
            compressed = encoded.is_compressed(),
            "Stored cache entry"
        );

        match (local_result, remote_result) {
            (Some(Err(e)), None) | (None, Some(Err(e))) | (Some(Err(_)), Some(Err(e))) => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove a key from both tiers; true if either tier held it
    pub async fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        let local_deleted = self.local.delete(key);
        if local_deleted {
            self.metrics.local.record_deletes(1);
            self.emit_event(CacheEvent::delete(key, CacheTier::Local));
        }

        let remote_deleted = match self.remote.delete(key, self.defaults.timeout).await {
            Ok(deleted) => deleted,
            Err(Error::CircuitOpen) => false,
            Err(e) => {
                warn!(key = %key, error = %e, "Remote delete failed");
                self.record_failure(Some(CacheTier::Remote), Some(key), "delete", &e);
                false
            }
        };
        if remote_deleted {
            self.metrics.remote.record_deletes(1);
            self.emit_event(CacheEvent::delete(key, CacheTier::Remote));
        }

        let deleted = local_deleted || remote_deleted;
        if deleted {
            self.metrics.overall.record_deletes(1);
        }
        self.metrics.response_times.record(started.elapsed());
        deleted
    }

    /// Remove every entry selected by `request` from both tiers
    ///
    /// Returns the number of distinct keys removed. Local entries are removed
    /// even when the remote tier cannot be reached; the remote failure is
    /// then returned.
    pub async fn invalidate(&self, request: &InvalidationRequest) -> Result<u64> {
        let started = Instant::now();
        let result = self.invalidate_tiers(request).await;
        self.metrics.response_times.record(started.elapsed());
        result
    }

    async fn invalidate_tiers(&self, request: &InvalidationRequest) -> Result<u64> {
        if request.is_empty() {
            return Ok(0);
        }

        let pattern = request
            .pattern
            .as_deref()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Configuration(format!("invalid key pattern {}: {}", p, e)))
            })
            .transpose()?;

        let timeout = self.defaults.timeout;
        let mut removed: BTreeSet<String> = BTreeSet::new();
        let mut remote_error = None;

        if let (Some(glob), Some(raw)) = (&pattern, request.pattern.as_deref()) {
            removed.extend(self.local.remove_matching(glob));
            match self.remote.delete_by_pattern(raw, timeout).await {
                Ok(keys) => removed.extend(keys),
                Err(e) => remote_error = Some(e),
            }
        }

        if !request.tags.is_empty() || !request.dependencies.is_empty() {
            removed.extend(self.local.remove_tagged(&request.tags, &request.dependencies));
            match self
                .remote
                .delete_by_tags(&request.tags, &request.dependencies, timeout)
                .await
            {
                Ok(keys) => removed.extend(keys),
                Err(e) => remote_error = remote_error.or(Some(e)),
            }
        }

        let count = removed.len() as u64;
        self.metrics.overall.record_deletes(count);
        self.emit_event(CacheEvent::Invalidation {
            pattern: request.pattern.clone(),
            tags: request.tags.iter().cloned().collect(),
            dependencies: request.dependencies.iter().cloned().collect(),
            removed: count,
        });
        info!(
            pattern = ?request.pattern,
            tags = request.tags.len(),
            dependencies = request.dependencies.len(),
            removed = count,
            "Invalidated cache entries"
        );

        match remote_error {
            Some(e) => {
                let e = match e {
                    Error::CircuitOpen => Error::RemoteUnavailable("circuit breaker open".to_string()),
                    other => other,
                };
                warn!(error = %e, "Remote invalidation failed");
                self.record_failure(Some(CacheTier::Remote), None, "invalidate", &e);
                Err(e)
            }
            None => Ok(count),
        }
    }

    // =========================================================================
    // Cache-Aside
    // =========================================================================

    /// Return the cached value, or compute, store and return it
    ///
    /// With `single_flight` enabled, concurrent misses for the same key wait
    /// for the first caller's computation instead of running the factory
    /// again. With it disabled every concurrent miss runs the factory. A
    /// failure to store the computed value is logged and the value is still
    /// returned.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, options: &CacheOptions, factory: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let resolved = self.resolve(options);
        let result = self.compute_through(key, &resolved, factory).await;
        self.metrics.response_times.record(started.elapsed());
        result
    }

    async fn compute_through<T, F, Fut>(&self, key: &str, resolved: &ResolvedOptions, factory: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.get_typed(key, resolved).await {
            return Ok(value);
        }

        if !self.config.single_flight {
            return self.compute_and_store(key, resolved, factory).await;
        }

        let lock = self.in_flight.entry(key.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            match self.get_typed(key, resolved).await {
                Some(value) => Ok(value),
                None => self.compute_and_store(key, resolved, factory).await,
            }
        };

        // Drop the lock entry once no other caller holds it
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, &lock) && Arc::strong_count(current) == 2);
        result
    }

    async fn compute_and_store<T, F, Fut>(&self, key: &str, resolved: &ResolvedOptions, factory: F) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let value = match factory().await {
            Ok(value) => value,
            Err(e) => {
                let e = Error::Compute(e);
                self.record_failure(None, Some(key), "compute", &e);
                return Err(e);
            }
        };

        if let Err(e) = self.store(key, &value, resolved).await {
            warn!(key = %key, error = %e, "Computed value could not be cached");
        }
        Ok(value)
    }

    // =========================================================================
    // Warming and Refresh
    // =========================================================================

    /// Run every factory and store its result; failures do not stop the batch
    pub async fn warm(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let attempted = entries.len();
        let outcomes: Vec<(String, Result<()>)> = futures::stream::iter(entries)
            .map(|entry| async move {
                let result = self.warm_one(&entry).await;
                (entry.key, result)
            })
            .buffer_unordered(self.config.warm_concurrency)
            .collect()
            .await;

        let mut report = WarmReport {
            attempted,
            ..Default::default()
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to warm cache entry");
                    report.failures.push(WarmFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        if attempted > 0 {
            info!(attempted, succeeded = report.succeeded, failed = report.failures.len(), "Cache warm finished");
        }
        report
    }

    async fn warm_one(&self, entry: &WarmEntry) -> Result<()> {
        let value = match (entry.factory)().await {
            Ok(value) => value,
            Err(e) => {
                let e = Error::Compute(e);
                self.record_failure(None, Some(&entry.key), "warm", &e);
                return Err(e);
            }
        };
        self.set(&entry.key, &value, &entry.options).await
    }

    /// Warm only the entries whose strategy asks for startup preloading
    pub async fn preload(&self, entries: Vec<WarmEntry>) -> WarmReport {
        let selected: Vec<WarmEntry> = entries
            .into_iter()
            .filter(|entry| self.resolve(&entry.options).preload_on_startup)
            .collect();
        self.warm(selected).await
    }

    /// Keep `key` fresh from the background maintainer
    ///
    /// The resolved strategy must enable `background_refresh`.
    pub fn register_refresh(&self, key: impl Into<String>, options: CacheOptions, factory: ValueFactory) -> Result<()> {
        let key = key.into();
        if !self.resolve(&options).background_refresh {
            return Err(Error::Configuration(format!(
                "strategy for key {} does not enable background_refresh",
                key
            )));
        }
        debug!(key = %key, "Registered background refresh");
        self.refreshers.insert(key, RefreshRegistration { options, factory });
        Ok(())
    }

    /// Stop refreshing `key`
    pub fn unregister_refresh(&self, key: &str) -> bool {
        self.refreshers.remove(key).is_some()
    }

    /// Keys registered for background refresh
    pub fn refresh_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.refreshers.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Recompute registered entries that are missing or have consumed at
    /// least `refresh_ahead_ratio` of their TTL
    pub async fn refresh_due(&self, refresh_ahead_ratio: f64) -> WarmReport {
        let registered: Vec<WarmEntry> = self
            .refreshers
            .iter()
            .map(|r| WarmEntry::new(r.key().clone(), r.options.clone(), Arc::clone(&r.factory)))
            .collect();

        let mut due = Vec::new();
        for entry in registered {
            if self.needs_refresh(&entry, refresh_ahead_ratio).await {
                due.push(entry);
            }
        }
        self.warm(due).await
    }

    async fn needs_refresh(&self, entry: &WarmEntry, refresh_ahead_ratio: f64) -> bool {
        let resolved = self.resolve(&entry.options);
        if resolved.tier.includes_local() {
            return self
                .local
                .peek(&entry.key)
                .map(|e| e.is_expired() || e.ttl_consumed() >= refresh_ahead_ratio)
                .unwrap_or(true);
        }

        match self.remote.get(&entry.key, resolved.timeout).await {
            Ok(Some(remote)) => remote.metadata.ttl_consumed() >= refresh_ahead_ratio,
            Ok(None) => true,
            // Nowhere to write a refreshed value
            Err(_) => false,
        }
    }

    // =========================================================================
    // Maintenance and Introspection
    // =========================================================================

    /// Drop expired local entries, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let expired = self.local.sweep_expired();
        for key in &expired {
            self.emit_event(CacheEvent::evict(key, 0, EvictionReason::Expired));
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired local entries");
        }
        expired.len()
    }

    /// Purge expired entries the remote store does not expire on its own
    pub async fn purge_remote_expired(&self) -> u64 {
        match self.remote.purge_expired().await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(count = purged, "Purged expired remote entries");
                }
                purged
            }
            Err(e) => {
                debug!(error = %e, "Remote purge failed");
                0
            }
        }
    }

    /// Pull-style metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(&self.local.stats(), self.remote.breaker().state())
    }

    /// Zero all counters (operator action)
    pub fn reset_metrics(&self) {
        self.metrics.reset();
        info!("Cache metrics reset");
    }

    /// Probe both tiers
    pub async fn health_check(&self) -> HealthStatus {
        let stats = self.local.stats();
        let local_ok = stats.size_bytes <= stats.max_size_bytes && stats.item_count <= stats.max_items;
        let remote_ok = match self.remote.ping(self.defaults.timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Remote health probe failed");
                false
            }
        };

        HealthStatus {
            healthy: local_ok,
            local_ok,
            remote_ok,
            remote_backend: self.remote.store_name(),
            circuit_state: self.remote.breaker().state(),
        }
    }

    /// Remove every local entry
    pub fn clear_local(&self) -> usize {
        self.local.clear()
    }

    pub fn local_stats(&self) -> LocalTierStats {
        self.local.stats()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.remote.breaker().state()
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }
}
