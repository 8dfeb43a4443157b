//! Local Tier
//!
//! Bounded in-process store holding decoded values. Capacity is enforced
//! on both total encoded bytes and item count; when an insert would exceed
//! either limit, entries are evicted oldest-accessed first. Expired entries
//! are dropped lazily on access and eagerly by [`LocalTier::sweep_expired`].
//!
//! All mutations go through one mutex so size/count accounting and the
//! access order can never disagree.

use crate::cache::entry::CacheEntry;
use crate::error::{Error, Result};
use chrono::Utc;
use glob::Pattern;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// Configuration
// =============================================================================

/// Capacity limits for the local tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Maximum total encoded size of all entries
    pub max_size_bytes: u64,
    /// Maximum number of entries
    pub max_items: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            max_items: 10_000,
        }
    }
}

// =============================================================================
// Lookup / Stats types
// =============================================================================

/// Outcome of a local lookup
#[derive(Debug, Clone)]
pub enum LocalLookup {
    /// Live entry found
    Hit(Arc<Value>),
    /// Entry existed but its TTL had elapsed; it has been removed
    Expired,
    /// No entry
    Miss,
}

impl LocalLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, LocalLookup::Hit(_))
    }

    /// Get the value if this is a hit
    pub fn value(self) -> Option<Arc<Value>> {
        match self {
            LocalLookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

/// An entry removed to make room for another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedEntry {
    pub key: String,
    pub size_bytes: u64,
}

/// Point-in-time view of the local tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalTierStats {
    pub size_bytes: u64,
    pub item_count: usize,
    pub max_size_bytes: u64,
    pub max_items: usize,
    /// Entries removed for capacity
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct LocalState {
    /// Entries in access order (front = least recently accessed)
    entries: IndexMap<String, CacheEntry>,
    size_bytes: u64,
    evictions: u64,
    expirations: u64,
}

impl LocalState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.shift_remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn remove_where<F>(&mut self, mut predicate: F) -> Vec<String>
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &keys {
            self.remove(key);
        }
        keys
    }

    fn evict_oldest(&mut self) -> Option<EvictedEntry> {
        let (key, entry) = self.entries.shift_remove_index(0)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        self.evictions += 1;
        Some(EvictedEntry {
            key,
            size_bytes: entry.size_bytes,
        })
    }
}

// =============================================================================
// Local Tier
// =============================================================================

/// Bounded, recency-ordered in-process cache tier
pub struct LocalTier {
    state: Mutex<LocalState>,
    config: LocalTierConfig,
}

impl LocalTier {
    pub fn new(config: LocalTierConfig) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            config,
        }
    }

    /// Insert or replace an entry, evicting least-recently-accessed entries as needed
    ///
    /// An entry larger than `max_size_bytes` is rejected without touching
    /// existing entries.
    pub fn set(&self, entry: CacheEntry) -> Result<Vec<EvictedEntry>> {
        if entry.size_bytes > self.config.max_size_bytes {
            return Err(Error::CapacityRejected {
                key: entry.key,
                size: entry.size_bytes,
                max: self.config.max_size_bytes,
            });
        }
        if self.config.max_items == 0 {
            return Err(Error::CapacityRejected {
                key: entry.key,
                size: entry.size_bytes,
                max: 0,
            });
        }

        let mut state = self.state.lock();
        state.remove(&entry.key);

        let mut evicted = Vec::new();
        while state.size_bytes + entry.size_bytes > self.config.max_size_bytes
            || state.entries.len() + 1 > self.config.max_items
        {
            match state.evict_oldest() {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        state.size_bytes += entry.size_bytes;
        state.entries.insert(entry.key.clone(), entry);
        Ok(evicted)
    }

    /// Look up a key, refreshing its recency on hit
    pub fn get(&self, key: &str) -> LocalLookup {
        let mut state = self.state.lock();
        let now = Utc::now();

        let expired = match state.entries.get(key) {
            None => return LocalLookup::Miss,
            Some(entry) => entry.is_expired_at(now),
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            return LocalLookup::Expired;
        }

        // Move to the most-recently-accessed end
        match state.entries.shift_remove(key) {
            Some(mut entry) => {
                entry.record_access();
                let value = Arc::clone(&entry.value);
                state.entries.insert(key.to_string(), entry);
                LocalLookup::Hit(value)
            }
            None => LocalLookup::Miss,
        }
    }

    /// Read an entry without updating recency or removing it when expired
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Remove every entry, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.size_bytes = 0;
        count
    }

    /// Drop all expired entries, returning their keys
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let removed = state.remove_where(|entry| entry.is_expired_at(now));
        state.expirations += removed.len() as u64;
        removed
    }

    /// Drop entries whose key matches a glob pattern
    pub fn remove_matching(&self, pattern: &Pattern) -> Vec<String> {
        self.state
            .lock()
            .remove_where(|entry| pattern.matches(&entry.key))
    }

    /// Drop entries carrying any of `tags` or depending on any of `dependencies`
    pub fn remove_tagged(
        &self,
        tags: &BTreeSet<String>,
        dependencies: &BTreeSet<String>,
    ) -> Vec<String> {
        self.state
            .lock()
            .remove_where(|entry| entry.has_any_tag(tags) || entry.has_any_dependency(dependencies))
    }

    /// Keys in access order, least recently accessed first
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LocalTierStats {
        let state = self.state.lock();
        LocalTierStats {
            size_bytes: state.size_bytes,
            item_count: state.entries.len(),
            max_size_bytes: self.config.max_size_bytes,
            max_items: self.config.max_items,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }

    pub fn config(&self) -> &LocalTierConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn tier(max_size_bytes: u64, max_items: usize) -> LocalTier {
        LocalTier::new(LocalTierConfig {
            max_size_bytes,
            max_items,
        })
    }

    fn entry(key: &str, size: u64) -> CacheEntry {
        CacheEntry::new(key, json!(key), size, 60)
    }

    #[test]
    fn test_set_and_get() {
        let local = tier(1000, 10);
        local.set(entry("a", 10)).unwrap();

        let value = local.get("a").value().unwrap();
        assert_eq!(*value, json!("a"));
        assert_matches!(local.get("missing"), LocalLookup::Miss);

        let stats = local.stats();
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.size_bytes, 10);
    }

    #[test]
    fn test_replace_adjusts_accounting() {
        let local = tier(1000, 10);
        local.set(entry("a", 10)).unwrap();
        local.set(entry("a", 25)).unwrap();

        let stats = local.stats();
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.size_bytes, 25);
    }

    #[test]
    fn test_item_limit_evicts_least_recently_accessed() {
        let local = tier(1000, 3);
        local.set(entry("a", 1)).unwrap();
        local.set(entry("b", 1)).unwrap();
        local.set(entry("c", 1)).unwrap();

        // "a" becomes most recent, so "b" is now the oldest
        assert!(local.get("a").is_hit());

        let evicted = local.set(entry("d", 1)).unwrap();
        assert_eq!(
            evicted,
            vec![EvictedEntry {
                key: "b".into(),
                size_bytes: 1
            }]
        );
        assert!(local.contains("a"));
        assert!(!local.contains("b"));
        assert!(local.contains("c"));
        assert!(local.contains("d"));
        assert_eq!(local.stats().evictions, 1);
    }

    #[test]
    fn test_size_limit_evicts_until_fit() {
        let local = tier(100, 100);
        local.set(entry("a", 40)).unwrap();
        local.set(entry("b", 40)).unwrap();

        let evicted = local.set(entry("c", 70)).unwrap();
        assert_eq!(evicted.len(), 2);
        assert_eq!(local.keys(), vec!["c".to_string()]);
        assert_eq!(local.stats().size_bytes, 70);
    }

    #[test]
    fn test_oversized_entry_rejected_without_eviction() {
        let local = tier(100, 10);
        local.set(entry("a", 50)).unwrap();

        let result = local.set(entry("huge", 101));
        assert_matches!(result, Err(Error::CapacityRejected { size: 101, max: 100, .. }));
        assert!(local.contains("a"));

        // Exactly at the limit is accepted
        local.set(entry("full", 100)).unwrap();
        assert_eq!(local.keys(), vec!["full".to_string()]);
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let local = tier(500, 7);
        for i in 0..200u64 {
            let size = (i * 37) % 120 + 1;
            local.set(entry(&format!("k{}", i), size)).unwrap();
            if i % 3 == 0 {
                local.get(&format!("k{}", i / 2));
            }

            let stats = local.stats();
            assert!(stats.size_bytes <= stats.max_size_bytes);
            assert!(stats.item_count <= stats.max_items);
        }
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let local = tier(1000, 10);
        let mut stale = entry("old", 5);
        stale.created_at = Utc::now() - ChronoDuration::seconds(120);
        local.set(stale).unwrap();

        assert_matches!(local.get("old"), LocalLookup::Expired);
        assert!(!local.contains("old"));
        assert_eq!(local.stats().size_bytes, 0);
        assert_eq!(local.stats().expirations, 1);
    }

    #[test]
    fn test_sweep_expired() {
        let local = tier(1000, 10);
        let mut stale = entry("old", 5);
        stale.created_at = Utc::now() - ChronoDuration::seconds(120);
        local.set(stale).unwrap();
        local.set(entry("fresh", 5)).unwrap();

        let removed = local.sweep_expired();
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(local.keys(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_remove_matching_and_tagged() {
        let local = tier(1000, 10);
        local.set(entry("product:1", 1).with_tags(["catalog"])).unwrap();
        local.set(entry("product:2", 1)).unwrap();
        local.set(entry("user:1", 1).with_dependencies(["db:users"])).unwrap();

        let pattern = Pattern::new("product:*").unwrap();
        let mut removed = local.remove_matching(&pattern);
        removed.sort();
        assert_eq!(removed, vec!["product:1".to_string(), "product:2".to_string()]);

        let deps: BTreeSet<String> = ["db:users".to_string()].into();
        let removed = local.remove_tagged(&BTreeSet::new(), &deps);
        assert_eq!(removed, vec!["user:1".to_string()]);
        assert!(local.is_empty());
    }

    #[test]
    fn test_delete_and_clear() {
        let local = tier(1000, 10);
        local.set(entry("a", 3)).unwrap();
        local.set(entry("b", 3)).unwrap();

        assert!(local.delete("a"));
        assert!(!local.delete("a"));
        assert_eq!(local.clear(), 1);
        assert_eq!(local.stats().size_bytes, 0);
    }
}
