//! Background Maintenance
//!
//! Periodic jobs that run beside the cache: sweeping expired local
//! entries and purging expired remote ones, publishing metrics snapshots, and refreshing entries
//! registered for background refresh. A failing job is logged and runs
//! again on its next tick.

use crate::cache::events::CacheEvent;
use crate::cache::manager::TieredCache;
use crate::cache::metrics::MetricsExporter;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Schedule for the background maintainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How often expired local entries are dropped
    pub sweep_interval: Duration,
    /// How often a metrics snapshot is published
    pub metrics_interval: Duration,
    /// How often refresh registrations are checked
    pub refresh_interval: Duration,
    /// Fraction of its TTL an entry may consume before it is refreshed
    pub refresh_ahead_ratio: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(15),
            refresh_interval: Duration::from_secs(60),
            refresh_ahead_ratio: 0.8,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero()
            || self.metrics_interval.is_zero()
            || self.refresh_interval.is_zero()
        {
            return Err(Error::Configuration(
                "maintenance intervals must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.refresh_ahead_ratio) {
            return Err(Error::Configuration(format!(
                "refresh_ahead_ratio must be within [0, 1], got {}",
                self.refresh_ahead_ratio
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Maintainer
// =============================================================================

/// Spawns the periodic jobs for one [`TieredCache`]
pub struct BackgroundMaintainer {
    cache: Arc<TieredCache>,
    config: MaintenanceConfig,
    exporter: Option<Arc<MetricsExporter>>,
}

impl BackgroundMaintainer {
    /// Create a maintainer using the cache's own schedule
    pub fn new(cache: Arc<TieredCache>) -> Self {
        let config = cache.config().maintenance.clone();
        Self {
            cache,
            config,
            exporter: None,
        }
    }

    /// Override the schedule
    pub fn with_config(mut self, config: MaintenanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirror each published snapshot into a Prometheus exporter
    pub fn with_exporter(mut self, exporter: Arc<MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Spawn the jobs onto the current runtime
    pub fn start(self) -> Result<MaintenanceHandle> {
        self.config.validate()?;

        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        let cache = Arc::clone(&self.cache);
        tasks.push(spawn_periodic(
            "sweep",
            self.config.sweep_interval,
            token.clone(),
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.sweep_expired();
                    cache.purge_remote_expired().await;
                }
            },
        ));

        let cache = Arc::clone(&self.cache);
        let exporter = self.exporter.clone();
        tasks.push(spawn_periodic(
            "metrics",
            self.config.metrics_interval,
            token.clone(),
            move || {
                let cache = Arc::clone(&cache);
                let exporter = exporter.clone();
                async move {
                    publish_metrics(&cache, exporter.as_deref());
                }
            },
        ));

        let cache = Arc::clone(&self.cache);
        let ratio = self.config.refresh_ahead_ratio;
        tasks.push(spawn_periodic(
            "refresh",
            self.config.refresh_interval,
            token.clone(),
            move || {
                let cache = Arc::clone(&cache);
                async move {
                    let report = cache.refresh_due(ratio).await;
                    if !report.failures.is_empty() {
                        warn!(
                            attempted = report.attempted,
                            failed = report.failures.len(),
                            "Background refresh had failures"
                        );
                    }
                }
            },
        ));

        info!(
            sweep_secs = self.config.sweep_interval.as_secs_f64(),
            metrics_secs = self.config.metrics_interval.as_secs_f64(),
            refresh_secs = self.config.refresh_interval.as_secs_f64(),
            "Background maintenance started"
        );
        Ok(MaintenanceHandle { token, tasks })
    }
}

fn publish_metrics(cache: &TieredCache, exporter: Option<&MetricsExporter>) {
    let snapshot = cache.metrics();
    if let Some(exporter) = exporter {
        exporter.update(&snapshot);
    }
    debug!(
        hits = snapshot.hits,
        misses = snapshot.misses,
        hit_ratio = snapshot.hit_ratio,
        local_items = snapshot.local_items,
        circuit = %snapshot.circuit_state,
        "Published metrics snapshot"
    );
    cache.emit_event(CacheEvent::StatsSnapshot(Box::new(snapshot)));
}

fn spawn_periodic<F, Fut>(
    job: &'static str,
    period: Duration,
    token: CancellationToken,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => work().await,
            }
        }
        debug!(job, "Maintenance job stopped");
    })
}

/// Running maintenance jobs
pub struct MaintenanceHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop every job and wait for it to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Maintenance job ended abnormally");
            }
        }
        info!("Background maintenance stopped");
    }

    /// True until every job has exited
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manager::{value_factory, TieredCacheConfig};
    use crate::cache::remote::MemoryRemoteStore;
    use crate::cache::strategy::CacheOptions;
    use crate::cache::tier::TierSelection;

    fn test_cache() -> Arc<TieredCache> {
        TieredCache::new(TieredCacheConfig::default(), Arc::new(MemoryRemoteStore::new())).unwrap()
    }

    fn fast_schedule() -> MaintenanceConfig {
        MaintenanceConfig {
            sweep_interval: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(1),
            refresh_ahead_ratio: 0.8,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(MaintenanceConfig::default().validate().is_ok());

        let config = MaintenanceConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MaintenanceConfig {
            refresh_ahead_ratio: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_snapshot_is_published() {
        let cache = test_cache();
        let exporter = Arc::new(MetricsExporter::new().unwrap());
        let mut events = cache.subscribe();

        let handle = BackgroundMaintainer::new(Arc::clone(&cache))
            .with_config(fast_schedule())
            .with_exporter(Arc::clone(&exporter))
            .start()
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, CacheEvent::StatsSnapshot(_)));

        let (_, body) = exporter.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("smart_cache_local_items"));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_keys_are_refreshed() {
        let cache = test_cache();
        cache
            .register_refresh(
                "catalog:all",
                CacheOptions::with_strategy("catalog"),
                value_factory(|| async { Ok(vec!["a", "b"]) }),
            )
            .unwrap();
        let mut events = cache.subscribe();

        let handle = BackgroundMaintainer::new(Arc::clone(&cache))
            .with_config(fast_schedule())
            .start()
            .unwrap();

        loop {
            if let CacheEvent::Set { key, .. } = events.recv().await.unwrap() {
                assert_eq!(key, "catalog:all");
                break;
            }
        }
        handle.shutdown().await;

        let value: Option<Vec<String>> = cache.get("catalog:all", &CacheOptions::new()).await;
        assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept() {
        let cache = test_cache();
        let options = CacheOptions::new().ttl(1).tier(TierSelection::Local);
        cache.set("short", &1, &options).await.unwrap();
        cache.set("long", &2, &options.clone().ttl(60)).await.unwrap();

        let handle = BackgroundMaintainer::new(Arc::clone(&cache))
            .with_config(fast_schedule())
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.local_stats().item_count, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_expired_remote_entries_are_purged() {
        let store = Arc::new(MemoryRemoteStore::new());
        let cache = TieredCache::new(TieredCacheConfig::default(), store.clone()).unwrap();
        let options = CacheOptions::new().ttl(1).tier(TierSelection::Remote);
        cache.set("short", &1, &options).await.unwrap();
        cache.set("long", &2, &options.clone().ttl(60)).await.unwrap();

        let handle = BackgroundMaintainer::new(Arc::clone(&cache))
            .with_config(fast_schedule())
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.stored_len(), 1);
        assert!(store.contains("long"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_jobs() {
        let cache = test_cache();
        let handle = BackgroundMaintainer::new(cache).start().unwrap();
        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let cache = test_cache();
        let result = tokio_test::block_on(async {
            BackgroundMaintainer::new(cache)
                .with_config(MaintenanceConfig {
                    refresh_interval: Duration::ZERO,
                    ..Default::default()
                })
                .start()
                .map(|_| ())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
