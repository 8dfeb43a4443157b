//! In-Process Remote Store
//!
//! A `RemoteStore` backed by DashMap. Used as the standalone backend of the
//! binary and as the remote store in tests, with fault injection: forced
//! unavailability, injected latency and per-primitive call counters.

use crate::cache::remote::RemoteStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Bytes,
    /// `None` when the TTL runs past what the clock can represent
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Remote store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    del_calls: AtomicU64,
    keys_calls: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `RemoteUnavailable` (after the injected latency)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn del_calls(&self) -> u64 {
        self.del_calls.load(Ordering::SeqCst)
    }

    pub fn keys_calls(&self) -> u64 {
        self.keys_calls.load(Ordering::SeqCst)
    }

    /// Total calls across all primitives
    pub fn total_calls(&self) -> u64 {
        self.get_calls() + self.set_calls() + self.del_calls() + self.keys_calls()
    }

    /// Read raw stored bytes, bypassing faults and counters
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.bytes.clone())
    }

    /// Write raw bytes, bypassing faults and counters
    pub fn insert_raw(&self, key: impl Into<String>, bytes: Bytes, ttl: Duration) {
        self.entries.insert(
            key.into(),
            StoredValue {
                bytes,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    /// Whether a live value is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored keys, including expired ones not yet purged
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    async fn enter(&self, counter: &AtomicU64) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.enter(&self.get_calls).await?;

        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(value) if value.is_live(now) => return Ok(Some(value.bytes.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| !v.is_live(now));
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()> {
        self.enter(&self.set_calls).await?;

        if ttl_secs == 0 {
            return Err(Error::Internal(format!(
                "invalid expire time in set for key {}",
                key
            )));
        }
        self.insert_raw(key, value, Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.enter(&self.del_calls).await?;

        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .filter(|(_, v)| v.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.enter(&self.keys_calls).await?;

        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Configuration(format!("invalid key pattern {}: {}", pattern, e)))?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.enter(&self.get_calls).await
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut purged = 0u64;
        self.entries.retain(|_, value| {
            let live = value.is_live(now);
            if !live {
                purged += 1;
            }
            live
        });
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_basic_primitives() {
        let store = MemoryRemoteStore::new();
        store.set_ex("a", Bytes::from_static(b"1"), 60).await.unwrap();
        store.set_ex("b", Bytes::from_static(b"2"), 60).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let removed = store
            .del(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.set_calls(), 2);
        assert_eq!(store.del_calls(), 1);
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let store = MemoryRemoteStore::new();
        for key in ["product:1", "product:2", "user:1"] {
            store.set_ex(key, Bytes::from_static(b"x"), 60).await.unwrap();
        }

        let mut keys = store.keys("product:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["product:1", "product:2"]);

        assert_matches!(store.keys("[").await, Err(Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryRemoteStore::new();
        store.set_ex("a", Bytes::from_static(b"1"), 1).await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(store.get("a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_unread_expired_keys() {
        let store = MemoryRemoteStore::new();
        for i in 0..10 {
            store
                .set_ex(&format!("short:{}", i), Bytes::from_static(b"1"), 1)
                .await
                .unwrap();
        }
        store.set_ex("long", Bytes::from_static(b"2"), 60).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.stored_len(), 11);

        assert_eq!(store.purge_expired().await.unwrap(), 10);
        assert_eq!(store.stored_len(), 1);
        assert!(store.contains("long"));
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_ttl_does_not_overflow() {
        let store = MemoryRemoteStore::new();
        store
            .set_ex("forever", Bytes::from_static(b"1"), u64::MAX)
            .await
            .unwrap();
        store.insert_raw("raw", Bytes::from_static(b"2"), Duration::MAX);

        assert!(store.get("forever").await.unwrap().is_some());
        assert!(store.contains("raw"));
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryRemoteStore::new();
        store.set_unavailable(true);

        assert_matches!(store.get("a").await, Err(Error::RemoteUnavailable(_)));
        assert_matches!(
            store.set_ex("a", Bytes::new(), 1).await,
            Err(Error::RemoteUnavailable(_))
        );
        assert_eq!(store.total_calls(), 2);

        store.set_unavailable(false);
        assert!(store.get("a").await.is_ok());
    }
}
