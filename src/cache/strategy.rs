//! Cache Strategies
//!
//! Named, immutable caching policies and the per-call options that
//! override them. Effective options are resolved field by field:
//! call options, then the named strategy, then engine defaults.

use crate::cache::tier::TierSelection;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Cache Strategy
// =============================================================================

fn default_compress() -> bool {
    true
}

/// A named caching policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStrategy {
    pub ttl_secs: u64,
    #[serde(default)]
    pub tier: TierSelection,
    #[serde(default = "default_compress")]
    pub compress: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Keep registered entries fresh from the background maintainer
    #[serde(default)]
    pub background_refresh: bool,
    /// Include entries in startup preloading
    #[serde(default)]
    pub preload_on_startup: bool,
}

impl CacheStrategy {
    /// Create a strategy with the given TTL and defaults for everything else
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            tier: TierSelection::Both,
            compress: true,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            background_refresh: false,
            preload_on_startup: false,
        }
    }

    pub fn with_tier(mut self, tier: TierSelection) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = enabled;
        self
    }

    pub fn with_preload(mut self, enabled: bool) -> Self {
        self.preload_on_startup = enabled;
        self
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(Error::Configuration(format!(
                "strategy {} must have a positive ttl_secs",
                name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Strategy Registry
// =============================================================================

/// Read-mostly registry of named strategies
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<CacheStrategy>>>,
}

impl StrategyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in catalog
    ///
    /// - `query-result`: short-lived query results in both tiers
    /// - `catalog`: long-lived reference data, preloaded and kept fresh
    /// - `session`: session data, remote only and uncompressed
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let catalog = [
            (
                "query-result",
                CacheStrategy::new(300).with_tags(["query"]),
            ),
            (
                "catalog",
                CacheStrategy::new(3600)
                    .with_tags(["catalog"])
                    .with_background_refresh(true)
                    .with_preload(true),
            ),
            (
                "session",
                CacheStrategy::new(1800)
                    .with_tier(TierSelection::Remote)
                    .with_compression(false)
                    .with_tags(["session"]),
            ),
        ];

        {
            let mut strategies = registry.strategies.write();
            for (name, strategy) in catalog {
                strategies.insert(name.to_string(), Arc::new(strategy));
            }
        }
        registry
    }

    /// Build a registry from a YAML map of name to strategy
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parsed: HashMap<String, CacheStrategy> = serde_yaml::from_str(yaml)?;
        let registry = Self::new();
        for (name, strategy) in parsed {
            registry.register(name, strategy)?;
        }
        Ok(registry)
    }

    /// Load a YAML strategy catalog from disk
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let registry = Self::from_yaml(&yaml)?;
        info!(path = %path.display(), strategies = registry.len(), "Loaded strategy catalog");
        Ok(registry)
    }

    /// Register a strategy; names are immutable once taken
    pub fn register(&self, name: impl Into<String>, strategy: CacheStrategy) -> Result<()> {
        let name = name.into();
        strategy.validate(&name)?;

        let mut strategies = self.strategies.write();
        if strategies.contains_key(&name) {
            return Err(Error::StrategyExists(name));
        }
        debug!(strategy = %name, ttl_secs = strategy.ttl_secs, tier = %strategy.tier, "Registered cache strategy");
        strategies.insert(name, Arc::new(strategy));
        Ok(())
    }

    /// Look up a strategy by name
    pub fn get(&self, name: &str) -> Option<Arc<CacheStrategy>> {
        self.strategies.read().get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.strategies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.read().is_empty()
    }
}

// =============================================================================
// Per-Call Options
// =============================================================================

/// Per-call options; every `Some` field overrides the strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub strategy: Option<String>,
    pub ttl_secs: Option<u64>,
    pub tier: Option<TierSelection>,
    pub compress: Option<bool>,
    pub tags: Option<BTreeSet<String>>,
    pub dependencies: Option<BTreeSet<String>>,
    /// Deadline for each remote call made on behalf of this operation
    #[serde(default, with = "optional_millis")]
    pub timeout: Option<Duration>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that only name a strategy
    pub fn with_strategy(name: impl Into<String>) -> Self {
        Self::new().strategy(name)
    }

    pub fn strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(name.into());
        self
    }

    pub fn ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn tier(mut self, tier: TierSelection) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Engine-wide fallbacks used when neither the call nor a strategy sets a field
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub ttl_secs: u64,
    pub tier: TierSelection,
    pub compress: bool,
    pub timeout: Duration,
}

/// Fully resolved options for one operation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub strategy: Option<String>,
    pub ttl_secs: u64,
    pub tier: TierSelection,
    pub compress: bool,
    pub tags: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    pub timeout: Duration,
    pub background_refresh: bool,
    pub preload_on_startup: bool,
}

impl StrategyRegistry {
    /// Merge call options over the named strategy over engine defaults
    ///
    /// An unknown strategy name is logged and ignored.
    pub fn resolve(&self, options: &CacheOptions, defaults: &EngineDefaults) -> ResolvedOptions {
        let strategy = options.strategy.as_deref().and_then(|name| {
            let found = self.get(name);
            if found.is_none() {
                warn!(strategy = %name, "Unknown cache strategy, using engine defaults");
            }
            found
        });

        let from_strategy = |f: fn(&CacheStrategy) -> bool| strategy.as_deref().map(f).unwrap_or(false);

        ResolvedOptions {
            strategy: strategy.as_ref().and(options.strategy.clone()),
            ttl_secs: options
                .ttl_secs
                .or(strategy.as_ref().map(|s| s.ttl_secs))
                .unwrap_or(defaults.ttl_secs),
            tier: options
                .tier
                .or(strategy.as_ref().map(|s| s.tier))
                .unwrap_or(defaults.tier),
            compress: options
                .compress
                .or(strategy.as_ref().map(|s| s.compress))
                .unwrap_or(defaults.compress),
            tags: options
                .tags
                .clone()
                .or_else(|| strategy.as_ref().map(|s| s.tags.clone()))
                .unwrap_or_default(),
            dependencies: options
                .dependencies
                .clone()
                .or_else(|| strategy.as_ref().map(|s| s.dependencies.clone()))
                .unwrap_or_default(),
            timeout: options.timeout.unwrap_or(defaults.timeout),
            background_refresh: from_strategy(|s| s.background_refresh),
            preload_on_startup: from_strategy(|s| s.preload_on_startup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn defaults() -> EngineDefaults {
        EngineDefaults {
            ttl_secs: 60,
            tier: TierSelection::Both,
            compress: true,
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_default_catalog() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["catalog", "query-result", "session"]);

        let session = registry.get("session").unwrap();
        assert_eq!(session.tier, TierSelection::Remote);
        assert!(!session.compress);
        assert!(registry.get("catalog").unwrap().preload_on_startup);
    }

    #[test]
    fn test_register_is_immutable() {
        let registry = StrategyRegistry::new();
        registry.register("short", CacheStrategy::new(5)).unwrap();
        assert_matches!(
            registry.register("short", CacheStrategy::new(10)),
            Err(Error::StrategyExists(name)) if name == "short"
        );
        assert_eq!(registry.get("short").unwrap().ttl_secs, 5);
    }

    #[test]
    fn test_register_rejects_zero_ttl() {
        let registry = StrategyRegistry::new();
        assert_matches!(
            registry.register("bad", CacheStrategy::new(0)),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_resolution_precedence() {
        let registry = StrategyRegistry::new();
        registry
            .register(
                "products",
                CacheStrategy::new(600)
                    .with_tier(TierSelection::Remote)
                    .with_compression(false)
                    .with_tags(["products"]),
            )
            .unwrap();

        // Strategy beats engine defaults
        let resolved = registry.resolve(&CacheOptions::with_strategy("products"), &defaults());
        assert_eq!(resolved.ttl_secs, 600);
        assert_eq!(resolved.tier, TierSelection::Remote);
        assert!(!resolved.compress);
        assert!(resolved.tags.contains("products"));
        assert_eq!(resolved.timeout, Duration::from_millis(500));

        // Call options beat the strategy field by field
        let options = CacheOptions::with_strategy("products")
            .ttl(5)
            .tags(["flash-sale"])
            .timeout(Duration::from_millis(50));
        let resolved = registry.resolve(&options, &defaults());
        assert_eq!(resolved.ttl_secs, 5);
        assert_eq!(resolved.tier, TierSelection::Remote);
        assert_eq!(resolved.tags, BTreeSet::from(["flash-sale".to_string()]));
        assert_eq!(resolved.timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_strategy_falls_back() {
        let registry = StrategyRegistry::with_defaults();
        let resolved = registry.resolve(&CacheOptions::with_strategy("nope"), &defaults());
        assert_eq!(resolved.strategy, None);
        assert_eq!(resolved.ttl_secs, 60);
        assert_eq!(resolved.tier, TierSelection::Both);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
products:
  ttl_secs: 900
  tier: remote
  tags: [products]
  background_refresh: true
sessions:
  ttl_secs: 1800
  compress: false
"#;
        let registry = StrategyRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 2);

        let products = registry.get("products").unwrap();
        assert_eq!(products.tier, TierSelection::Remote);
        assert!(products.compress);
        assert!(products.background_refresh);

        let sessions = registry.get("sessions").unwrap();
        assert_eq!(sessions.tier, TierSelection::Both);
        assert!(!sessions.compress);

        assert_matches!(StrategyRegistry::from_yaml("x: [1, 2"), Err(Error::Yaml(_)));
    }

    #[test]
    fn test_options_serde() {
        let options = CacheOptions::new().ttl(30).timeout(Duration::from_millis(250));
        let json = serde_json::to_string(&options).unwrap();
        let parsed: CacheOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }
}
