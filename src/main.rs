//! Smart Cache
//!
//! Runs a tiered cache engine as a standalone process: the background
//! maintainer keeps it swept, refreshed and measured, and two small HTTP
//! servers expose health and Prometheus metrics.
//!
//! # Endpoints
//!
//! ```text
//! health server   /healthz /livez   liveness
//!                 /readyz           tier health (JSON, 503 when unhealthy)
//!                 /stats            metrics snapshot (JSON)
//! metrics server  /metrics          Prometheus text format
//! ```

use clap::{Parser, ValueEnum};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use smart_cache::cache::{
    BackgroundMaintainer, CircuitBreakerConfig, CompressionConfig, LocalTierConfig,
    MaintenanceConfig, SharedRemoteStore,
};
use smart_cache::{
    CompressionAlgorithm, Error, MemoryRemoteStore, MetricsExporter, Result, StrategyRegistry,
    TierSelection, TieredCache, TieredCacheConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RemoteBackend {
    /// In-process store (single node, testing)
    Memory,
    /// Redis (requires the `redis-store` feature)
    Redis,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Compression {
    None,
    Lz4,
    Zstd,
    Snappy,
}

impl From<Compression> for CompressionAlgorithm {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => CompressionAlgorithm::None,
            Compression::Lz4 => CompressionAlgorithm::Lz4,
            Compression::Zstd => CompressionAlgorithm::Zstd,
            Compression::Snappy => CompressionAlgorithm::Snappy,
        }
    }
}

/// Smart Cache - multi-tier cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Remote tier backend
    #[arg(long, env = "REMOTE_BACKEND", value_enum, default_value = "memory")]
    remote_backend: RemoteBackend,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// YAML file of named strategies (built-in catalog when omitted)
    #[arg(long, env = "STRATEGIES_FILE")]
    strategies_file: Option<PathBuf>,

    /// Local tier byte budget
    #[arg(long, env = "LOCAL_MAX_BYTES", default_value = "67108864")]
    local_max_bytes: u64,

    /// Local tier item limit
    #[arg(long, env = "LOCAL_MAX_ITEMS", default_value = "10000")]
    local_max_items: usize,

    /// TTL used when no strategy or option sets one
    #[arg(long, env = "DEFAULT_TTL_SECS", default_value = "300")]
    default_ttl_secs: u64,

    /// Deadline for each remote call in milliseconds
    #[arg(long, env = "REMOTE_TIMEOUT_MS", default_value = "2000")]
    remote_timeout_ms: u64,

    /// Consecutive remote failures that open the circuit
    #[arg(long, env = "CIRCUIT_FAILURE_THRESHOLD", default_value = "5")]
    circuit_failure_threshold: u32,

    /// Seconds the circuit stays open before a probe
    #[arg(long, env = "CIRCUIT_COOLDOWN_SECS", default_value = "30")]
    circuit_cooldown_secs: u64,

    /// Compression algorithm for remote payloads
    #[arg(long, env = "COMPRESSION", value_enum, default_value = "lz4")]
    compression: Compression,

    /// Payloads larger than this many bytes are compressed
    #[arg(long, env = "COMPRESSION_THRESHOLD", default_value = "1024")]
    compression_threshold: u64,

    /// Expired-entry sweep interval in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "30")]
    sweep_interval_secs: u64,

    /// Metrics snapshot interval in seconds
    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value = "15")]
    metrics_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> TieredCacheConfig {
        let defaults = TieredCacheConfig::default();
        TieredCacheConfig {
            local: LocalTierConfig {
                max_size_bytes: self.local_max_bytes,
                max_items: self.local_max_items,
            },
            compression: CompressionConfig {
                algorithm: self.compression.into(),
                threshold_bytes: self.compression_threshold,
                ..defaults.compression
            },
            circuit: CircuitBreakerConfig {
                failure_threshold: self.circuit_failure_threshold,
                cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            },
            default_ttl_secs: self.default_ttl_secs,
            default_tier: TierSelection::Both,
            remote_timeout: Duration::from_millis(self.remote_timeout_ms),
            maintenance: MaintenanceConfig {
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
                metrics_interval: Duration::from_secs(self.metrics_interval_secs),
                ..defaults.maintenance
            },
            ..defaults
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Smart Cache");
    info!("  Version: {}", smart_cache::VERSION);
    info!("  Remote backend: {:?}", args.remote_backend);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let strategies = match &args.strategies_file {
        Some(path) => {
            let registry = StrategyRegistry::from_yaml_file(path)?;
            info!(path = %path.display(), count = registry.len(), "Loaded strategies");
            registry
        }
        None => StrategyRegistry::with_defaults(),
    };

    let store = connect_remote(&args).await?;
    let cache = TieredCache::with_strategies(args.cache_config(), store, strategies)?;

    let exporter = Arc::new(MetricsExporter::new()?);
    let maintenance = BackgroundMaintainer::new(Arc::clone(&cache))
        .with_exporter(Arc::clone(&exporter))
        .start()?;

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_cache = Arc::clone(&cache);
    let health_shutdown = shutdown.clone();
    let health = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_cache, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let metrics_exporter = Arc::clone(&exporter);
    let metrics_shutdown = shutdown.clone();
    let metrics = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_exporter, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    maintenance.shutdown().await;
    let _ = tokio::join!(health, metrics);

    info!("Smart Cache shutdown complete");
    Ok(())
}

async fn connect_remote(args: &Args) -> Result<SharedRemoteStore> {
    match args.remote_backend {
        RemoteBackend::Memory => Ok(Arc::new(MemoryRemoteStore::new())),
        #[cfg(feature = "redis-store")]
        RemoteBackend::Redis => {
            let store = smart_cache::cache::RedisRemoteStore::connect(&args.redis_url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        RemoteBackend::Redis => Err(Error::Configuration(format!(
            "redis backend ({}) requires the redis-store feature",
            args.redis_url
        ))),
    }
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn respond(status: StatusCode, content_type: HeaderValue, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

fn respond_json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, HeaderValue::from_static("application/json"), body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderValue::from_static("text/plain"),
            e.to_string(),
        ),
    }
}

fn not_found() -> Response<Body> {
    respond(StatusCode::NOT_FOUND, HeaderValue::from_static("text/plain"), "not found")
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_response(cache: &TieredCache, path: &str) -> Response<Body> {
    match path {
        "/healthz" | "/livez" => respond(StatusCode::OK, HeaderValue::from_static("text/plain"), "ok"),
        "/readyz" => {
            let health = cache.health_check().await;
            let status = if health.healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            respond_json(status, &health)
        }
        "/stats" => respond_json(StatusCode::OK, &cache.metrics()),
        _ => not_found(),
    }
}

async fn run_health_server(
    addr: SocketAddr,
    cache: Arc<TieredCache>,
    shutdown: CancellationToken,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let cache = Arc::clone(&cache);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let cache = Arc::clone(&cache);
                async move { Ok::<_, Infallible>(health_response(&cache, req.uri().path()).await) }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

fn metrics_response(exporter: &MetricsExporter, path: &str) -> Response<Body> {
    match path {
        "/metrics" => match exporter.encode() {
            Ok((content_type, buffer)) => {
                let content_type = HeaderValue::from_str(&content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
                respond(StatusCode::OK, content_type, buffer)
            }
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderValue::from_static("text/plain"),
                e.to_string(),
            ),
        },
        _ => not_found(),
    }
}

async fn run_metrics_server(
    addr: SocketAddr,
    exporter: Arc<MetricsExporter>,
    shutdown: CancellationToken,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let exporter = Arc::clone(&exporter);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let exporter = Arc::clone(&exporter);
                async move { Ok::<_, Infallible>(metrics_response(&exporter, req.uri().path())) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
