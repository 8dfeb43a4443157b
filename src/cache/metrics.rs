//! Cache Metrics
//!
//! Cache-line aligned counters for concurrent updates from every cache
//! operation, pull-style snapshots, and a Prometheus exporter that mirrors
//! those snapshots.

use crate::cache::circuit::CircuitState;
use crate::cache::local::LocalTierStats;
use crate::cache::tier::CacheTier;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Counter Block (Cache-Line Aligned)
// =============================================================================

/// Counters for one tier (or for the engine as a whole), aligned to prevent
/// false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct CacheTierMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub errors: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
    /// Padding to fill cache line
    _padding: [u8; 8],
}

// Verify size at compile time
const _: () = assert!(std::mem::size_of::<CacheTierMetrics>() <= CACHE_LINE_SIZE);

impl Default for CacheTierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheTierMetrics {
    /// Create new zeroed metrics
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.deletes,
            &self.evictions,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.touch();
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        self.snapshot().hit_ratio()
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> TierMetricsSnapshot {
        TierMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of one counter block
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
}

impl TierMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Response Times
// =============================================================================

/// Running average of operation latency
#[derive(Debug, Default)]
pub struct ResponseTimes {
    total_micros: AtomicU64,
    operations: AtomicU64,
}

impl ResponseTimes {
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn average_ms(&self) -> f64 {
        let operations = self.operations();
        if operations == 0 {
            0.0
        } else {
            self.total_micros.load(Ordering::Relaxed) as f64 / operations as f64 / 1000.0
        }
    }

    pub fn reset(&self) {
        self.total_micros.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// All counters owned by one cache instance
///
/// `overall` counts operations as the caller sees them: a hit in either
/// tier is one hit, a miss is a lookup that no tier answered.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub local: CacheTierMetrics,
    pub remote: CacheTierMetrics,
    pub overall: CacheTierMetrics,
    pub response_times: ResponseTimes,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get metrics for a specific tier
    pub fn tier(&self, tier: CacheTier) -> &CacheTierMetrics {
        match tier {
            CacheTier::Local => &self.local,
            CacheTier::Remote => &self.remote,
        }
    }

    /// Zero everything
    pub fn reset(&self) {
        self.local.reset();
        self.remote.reset();
        self.overall.reset();
        self.response_times.reset();
    }

    /// Combine counters with the live local-tier occupancy and breaker state
    pub fn snapshot(&self, local: &LocalTierStats, circuit_state: CircuitState) -> MetricsSnapshot {
        let overall = self.overall.snapshot();
        MetricsSnapshot {
            hits: overall.hits,
            misses: overall.misses,
            sets: overall.sets,
            deletes: overall.deletes,
            evictions: overall.evictions,
            errors: overall.errors,
            hit_ratio: overall.hit_ratio(),
            avg_response_time_ms: self.response_times.average_ms(),
            operations: self.response_times.operations(),
            local_bytes: local.size_bytes,
            local_items: local.item_count as u64,
            circuit_state,
            local: self.local.snapshot(),
            remote: self.remote.snapshot(),
            timestamp: Utc::now(),
        }
    }
}

/// Pull-style view of the engine's metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub avg_response_time_ms: f64,
    /// Operations timed into the average
    pub operations: u64,
    pub local_bytes: u64,
    pub local_items: u64,
    pub circuit_state: CircuitState,
    pub local: TierMetricsSnapshot,
    pub remote: TierMetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Prometheus Exporter
// =============================================================================

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus registry error: {}", e))
}

/// Mirrors [`MetricsSnapshot`]s into a Prometheus registry
pub struct MetricsExporter {
    registry: Registry,
    counters: IntGaugeVec,
    hit_ratio: Gauge,
    avg_response_time_ms: Gauge,
    local_bytes: IntGauge,
    local_items: IntGauge,
    circuit_state: IntGauge,
}

impl MetricsExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counters = IntGaugeVec::new(
            Opts::new("smart_cache_counter", "Cache counters by tier and kind"),
            &["tier", "kind"],
        )
        .map_err(prometheus_error)?;
        let hit_ratio = Gauge::new("smart_cache_hit_ratio", "Overall hit ratio")
            .map_err(prometheus_error)?;
        let avg_response_time_ms = Gauge::new(
            "smart_cache_avg_response_time_ms",
            "Average operation latency in milliseconds",
        )
        .map_err(prometheus_error)?;
        let local_bytes = IntGauge::new("smart_cache_local_bytes", "Bytes held by the local tier")
            .map_err(prometheus_error)?;
        let local_items = IntGauge::new("smart_cache_local_items", "Entries held by the local tier")
            .map_err(prometheus_error)?;
        let circuit_state = IntGauge::new(
            "smart_cache_circuit_state",
            "Remote circuit breaker state (0 closed, 1 open, 2 half-open)",
        )
        .map_err(prometheus_error)?;

        registry
            .register(Box::new(counters.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(hit_ratio.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(avg_response_time_ms.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(local_bytes.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(local_items.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(circuit_state.clone()))
            .map_err(prometheus_error)?;

        Ok(Self {
            registry,
            counters,
            hit_ratio,
            avg_response_time_ms,
            local_bytes,
            local_items,
            circuit_state,
        })
    }

    fn set_block(&self, tier: &str, block: &TierMetricsSnapshot) {
        let values = [
            ("hits", block.hits),
            ("misses", block.misses),
            ("sets", block.sets),
            ("deletes", block.deletes),
            ("evictions", block.evictions),
            ("errors", block.errors),
        ];
        for (kind, value) in values {
            self.counters
                .with_label_values(&[tier, kind])
                .set(value as i64);
        }
    }

    /// Publish a snapshot
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        self.set_block("local", &snapshot.local);
        self.set_block("remote", &snapshot.remote);
        self.set_block(
            "all",
            &TierMetricsSnapshot {
                hits: snapshot.hits,
                misses: snapshot.misses,
                sets: snapshot.sets,
                deletes: snapshot.deletes,
                evictions: snapshot.evictions,
                errors: snapshot.errors,
            },
        );
        self.hit_ratio.set(snapshot.hit_ratio);
        self.avg_response_time_ms.set(snapshot.avg_response_time_ms);
        self.local_bytes.set(snapshot.local_bytes as i64);
        self.local_items.set(snapshot.local_items as i64);
        self.circuit_state.set(snapshot.circuit_state.as_gauge());
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_stats(size_bytes: u64, item_count: usize) -> LocalTierStats {
        LocalTierStats {
            size_bytes,
            item_count,
            max_size_bytes: 1024,
            max_items: 10,
            evictions: 0,
            expirations: 0,
        }
    }

    #[test]
    fn test_cache_line_alignment() {
        assert_eq!(std::mem::align_of::<CacheTierMetrics>(), CACHE_LINE_SIZE);
        assert!(std::mem::size_of::<CacheTierMetrics>() <= CACHE_LINE_SIZE);
    }

    #[test]
    fn test_tier_metrics_operations() {
        let metrics = CacheTierMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_set();
        metrics.record_deletes(3);
        metrics.record_evictions(2);
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.deletes, 3);
        assert_eq!(snapshot.evictions, 2);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);

        metrics.reset();
        assert_eq!(metrics.snapshot(), TierMetricsSnapshot::default());
    }

    #[test]
    fn test_response_time_average() {
        let times = ResponseTimes::default();
        assert_eq!(times.average_ms(), 0.0);

        times.record(Duration::from_millis(2));
        times.record(Duration::from_millis(4));
        assert!((times.average_ms() - 3.0).abs() < 0.001);
        assert_eq!(times.operations(), 2);
    }

    #[test]
    fn test_snapshot_combines_sources() {
        let metrics = CacheMetrics::new();
        metrics.tier(CacheTier::Local).record_hit();
        metrics.tier(CacheTier::Remote).record_miss();
        metrics.overall.record_hit();
        metrics.overall.record_miss();

        let snapshot = metrics.snapshot(&local_stats(512, 3), CircuitState::Closed);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.local_bytes, 512);
        assert_eq!(snapshot.local_items, 3);
        assert_eq!(snapshot.local.hits, 1);
        assert_eq!(snapshot.remote.misses, 1);

        metrics.reset();
        let snapshot = metrics.snapshot(&local_stats(0, 0), CircuitState::Open);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.circuit_state, CircuitState::Open);
    }

    #[test]
    fn test_exporter_renders_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.overall.record_hit();
        let snapshot = metrics.snapshot(&local_stats(64, 1), CircuitState::HalfOpen);

        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&snapshot);

        let (content_type, body) = exporter.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("smart_cache_local_bytes 64"));
        assert!(text.contains("smart_cache_circuit_state 2"));
        assert!(text.contains(r#"smart_cache_counter{kind="hits",tier="all"} 1"#));
    }
}
