//! Remote Tier
//!
//! [`RemoteStore`] is the four-primitive boundary to the shared key-value
//! service (`GET`, `SET EX`, `DEL`, `KEYS`). [`RemoteTier`] sits on top of
//! it: it frames values in a self-describing envelope, keeps the tag and
//! dependency indexes, bounds every call with a deadline and routes every
//! call through the circuit breaker. It never retries.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

pub use memory::MemoryRemoteStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisRemoteStore;

use crate::cache::circuit::CircuitBreaker;
use crate::cache::entry::{EntryMetadata, RemoteEntry, MAX_TTL_SECS, SCHEMA_VERSION};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

// =============================================================================
// RemoteStore Trait
// =============================================================================

/// Boundary to the shared key-value service
///
/// Implementations report connectivity problems as
/// [`Error::RemoteUnavailable`] and a missing key as `Ok(None)`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs and health output
    fn name(&self) -> &'static str;

    /// `GET key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// `SET key value EX ttl_secs`
    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()>;

    /// `DEL key...`, returning how many keys existed
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// `KEYS pattern`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Connectivity probe
    async fn ping(&self) -> Result<()> {
        self.get("__ping").await.map(|_| ())
    }

    /// Drop entries whose TTL has passed, returning how many went
    ///
    /// Backends that expire keys on their own keep the default no-op.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

/// Type alias for a shared remote store
pub type SharedRemoteStore = Arc<dyn RemoteStore>;

// =============================================================================
// Envelope
// =============================================================================

/// Leading bytes of every envelope
pub const ENVELOPE_MAGIC: &[u8; 4] = b"SCE1";

const ENVELOPE_PREFIX_LEN: usize = 8;

/// Frame `payload` as `magic | u32 header-len | JSON header | payload`
pub fn encode_envelope(key: &str, metadata: &EntryMetadata, payload: &[u8]) -> Result<Bytes> {
    let header = serde_json::to_vec(metadata).map_err(|e| Error::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;

    let mut buf = BytesMut::with_capacity(ENVELOPE_PREFIX_LEN + header.len() + payload.len());
    buf.put_slice(ENVELOPE_MAGIC);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split an envelope into its header and payload
pub fn decode_envelope(key: &str, mut data: Bytes) -> Result<RemoteEntry> {
    let corrupt = |reason: String| Error::Decode {
        key: key.to_string(),
        reason,
    };

    if data.len() < ENVELOPE_PREFIX_LEN || &data[..4] != ENVELOPE_MAGIC {
        return Err(corrupt("missing envelope magic".to_string()));
    }
    data.advance(4);
    let header_len = data.get_u32() as usize;
    if data.len() < header_len {
        return Err(corrupt(format!(
            "header length {} exceeds remaining {} bytes",
            header_len,
            data.len()
        )));
    }

    let header = data.split_to(header_len);
    let metadata: EntryMetadata =
        serde_json::from_slice(&header).map_err(|e| corrupt(format!("bad header: {}", e)))?;
    if metadata.schema_version != SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema version {}",
            metadata.schema_version
        )));
    }

    Ok(RemoteEntry {
        bytes: data,
        metadata,
    })
}

// =============================================================================
// Tag / Dependency Indexes
// =============================================================================

const TAG_INDEX_PREFIX: &str = "__tag:";
const DEP_INDEX_PREFIX: &str = "__dep:";

/// Index key for a tag
pub fn tag_index_key(tag: &str) -> String {
    format!("{}{}", TAG_INDEX_PREFIX, tag)
}

/// Index key for a dependency
pub fn dependency_index_key(dep: &str) -> String {
    format!("{}{}", DEP_INDEX_PREFIX, dep)
}

/// Whether `key` belongs to the index namespace
pub fn is_index_key(key: &str) -> bool {
    key.starts_with(TAG_INDEX_PREFIX) || key.starts_with(DEP_INDEX_PREFIX)
}

/// Index members mapped to their expiry (unix seconds)
type IndexMembers = BTreeMap<String, i64>;

// =============================================================================
// Remote Tier Adapter
// =============================================================================

/// Remote tier adapter: envelope framing, indexes, deadlines, circuit breaking
///
/// Index read-modify-write cycles are serialized per index key within one
/// adapter. Writers in other processes sharing the store can still
/// interleave with them.
pub struct RemoteTier {
    store: SharedRemoteStore,
    breaker: Arc<CircuitBreaker>,
    index_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl RemoteTier {
    pub fn new(store: SharedRemoteStore, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store,
            breaker,
            index_locks: DashMap::new(),
        }
    }

    fn index_lock(&self, index_key: &str) -> Arc<AsyncMutex<()>> {
        self.index_locks
            .entry(index_key.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release_index_lock(&self, index_key: &str, lock: &Arc<AsyncMutex<()>>) {
        self.index_locks.remove_if(index_key, |_, current| {
            Arc::ptr_eq(current, lock) && Arc::strong_count(current) == 2
        });
    }

    /// Run one store call under the breaker with a deadline
    async fn call<T, Fut>(&self, operation: &'static str, timeout: Duration, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .execute(|| async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: operation.to_string(),
                        timeout,
                    }),
                }
            })
            .await
    }

    /// Fetch and unframe an entry
    ///
    /// A payload that is not a valid envelope yields a `Decode` error.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Option<RemoteEntry>> {
        let raw = self.call("get", timeout, self.store.get(key)).await?;
        raw.map(|data| decode_envelope(key, data)).transpose()
    }

    /// Store an entry and record it in its tag and dependency indexes
    ///
    /// Index maintenance is best effort: a failed index write is logged and
    /// does not fail the set. TTLs are clamped to [`MAX_TTL_SECS`].
    pub async fn set_with_ttl(
        &self,
        key: &str,
        payload: Bytes,
        mut metadata: EntryMetadata,
        ttl_secs: u64,
        timeout: Duration,
    ) -> Result<()> {
        let ttl_secs = ttl_secs.min(MAX_TTL_SECS);
        metadata.ttl_secs = ttl_secs;
        let envelope = encode_envelope(key, &metadata, &payload)?;
        self.call("set", timeout, self.store.set_ex(key, envelope, ttl_secs))
            .await?;

        let expires_at = metadata
            .created_at
            .timestamp()
            .saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        let index_keys = metadata
            .tags
            .iter()
            .map(|t| tag_index_key(t))
            .chain(metadata.dependencies.iter().map(|d| dependency_index_key(d)));

        for index_key in index_keys {
            if let Err(e) = self.add_to_index(&index_key, key, expires_at, timeout).await {
                warn!(key = %key, index = %index_key, error = %e, "Failed to update remote index");
            }
        }
        Ok(())
    }

    async fn read_index(&self, index_key: &str, timeout: Duration) -> Result<IndexMembers> {
        let raw = self.call("get", timeout, self.store.get(index_key)).await?;
        Ok(match raw {
            Some(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(index = %index_key, error = %e, "Discarding unreadable remote index");
                IndexMembers::new()
            }),
            None => IndexMembers::new(),
        })
    }

    async fn add_to_index(
        &self,
        index_key: &str,
        member: &str,
        expires_at: i64,
        timeout: Duration,
    ) -> Result<()> {
        let lock = self.index_lock(index_key);
        let guard = lock.lock().await;
        let result = self
            .write_index_member(index_key, member, expires_at, timeout)
            .await;
        drop(guard);
        self.release_index_lock(index_key, &lock);
        result
    }

    async fn write_index_member(
        &self,
        index_key: &str,
        member: &str,
        expires_at: i64,
        timeout: Duration,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut members = self.read_index(index_key, timeout).await?;
        members.retain(|_, expiry| *expiry > now);
        members.insert(member.to_string(), expires_at);

        // The index lives as long as its longest-lived member
        let ttl_secs = members
            .values()
            .max()
            .map(|latest| latest.saturating_sub(now).max(1) as u64)
            .unwrap_or(1);
        let data = Bytes::from(serde_json::to_vec(&members)?);
        self.call("set", timeout, self.store.set_ex(index_key, data, ttl_secs))
            .await
    }

    /// Delete a single key
    pub async fn delete(&self, key: &str, timeout: Duration) -> Result<bool> {
        let keys = vec![key.to_string()];
        let removed = self.call("del", timeout, self.store.del(&keys)).await?;
        Ok(removed > 0)
    }

    /// Delete every key matching a glob pattern, returning the keys removed
    ///
    /// Index keys are never matched.
    pub async fn delete_by_pattern(&self, pattern: &str, timeout: Duration) -> Result<Vec<String>> {
        let mut keys = self.call("keys", timeout, self.store.keys(pattern)).await?;
        keys.retain(|k| !is_index_key(k));
        if keys.is_empty() {
            return Ok(keys);
        }

        let removed = self.call("del", timeout, self.store.del(&keys)).await?;
        debug!(pattern = %pattern, matched = keys.len(), removed, "Remote pattern delete");
        Ok(keys)
    }

    /// Delete every key indexed under any of `tags` or `dependencies`,
    /// returning the keys that existed
    pub async fn delete_by_tags(
        &self,
        tags: &BTreeSet<String>,
        dependencies: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let index_keys: Vec<String> = tags
            .iter()
            .map(|t| tag_index_key(t))
            .chain(dependencies.iter().map(|d| dependency_index_key(d)))
            .collect();
        if index_keys.is_empty() {
            return Ok(Vec::new());
        }

        // Tag keys sort before dependency keys, so every caller locks in one order
        let locks: Vec<_> = index_keys.iter().map(|k| self.index_lock(k)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }
        let result = self.delete_indexed(&index_keys, timeout).await;
        drop(guards);
        for (index_key, lock) in index_keys.iter().zip(&locks) {
            self.release_index_lock(index_key, lock);
        }
        result
    }

    async fn delete_indexed(&self, index_keys: &[String], timeout: Duration) -> Result<Vec<String>> {
        let mut members = BTreeSet::new();
        for index_key in index_keys {
            members.extend(self.read_index(index_key, timeout).await?.into_keys());
        }

        let mut removed = Vec::with_capacity(members.len());
        for member in members {
            let keys = vec![member];
            if self.call("del", timeout, self.store.del(&keys)).await? > 0 {
                removed.extend(keys);
            }
        }

        self.call("del", timeout, self.store.del(index_keys))
            .await?;
        debug!(indexes = index_keys.len(), removed = removed.len(), "Remote tag delete");
        Ok(removed)
    }

    /// Purge expired entries from the store, outside the breaker
    pub async fn purge_expired(&self) -> Result<u64> {
        self.store.purge_expired().await
    }

    /// Connectivity probe, through the breaker
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.call("ping", timeout, self.store.ping()).await
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::circuit::{CircuitBreakerConfig, CircuitState};
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn remote_tier() -> (Arc<MemoryRemoteStore>, RemoteTier) {
        let store = Arc::new(MemoryRemoteStore::new());
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(30),
        }));
        let tier = RemoteTier::new(store.clone(), breaker);
        (store, tier)
    }

    fn metadata_with(tags: &[&str], deps: &[&str]) -> EntryMetadata {
        let mut metadata = EntryMetadata::new(60, 3);
        metadata.tags = tags.iter().map(|t| t.to_string()).collect();
        metadata.dependencies = deps.iter().map(|d| d.to_string()).collect();
        metadata
    }

    #[test]
    fn test_envelope_layout() {
        let metadata = metadata_with(&["t"], &[]);
        let envelope = encode_envelope("k", &metadata, b"abc").unwrap();
        assert_eq!(&envelope[..4], ENVELOPE_MAGIC);

        let entry = decode_envelope("k", envelope).unwrap();
        assert_eq!(entry.bytes.as_ref(), b"abc");
        assert_eq!(entry.metadata, metadata);
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert_matches!(
            decode_envelope("k", Bytes::from_static(b"42")),
            Err(Error::Decode { .. })
        );
        assert_matches!(
            decode_envelope("k", Bytes::from_static(b"SCE1\x00\x00\x00\xffxx")),
            Err(Error::Decode { .. })
        );
    }

    #[test]
    fn test_envelope_rejects_unknown_schema() {
        let mut metadata = EntryMetadata::new(60, 1);
        metadata.schema_version = SCHEMA_VERSION + 1;
        let envelope = encode_envelope("k", &metadata, b"1").unwrap();
        assert_matches!(decode_envelope("k", envelope), Err(Error::Decode { .. }));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let (_, tier) = remote_tier();
        tier.set_with_ttl("k", Bytes::from_static(b"\"v\""), metadata_with(&[], &[]), 60, TIMEOUT)
            .await
            .unwrap();

        let entry = tier.get("k", TIMEOUT).await.unwrap().unwrap();
        assert_eq!(entry.bytes.as_ref(), b"\"v\"");
        assert_eq!(entry.metadata.ttl_secs, 60);

        assert!(tier.delete("k", TIMEOUT).await.unwrap());
        assert!(!tier.delete("k", TIMEOUT).await.unwrap());
        assert!(tier.get("k", TIMEOUT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pattern_delete_skips_indexes() {
        let (store, tier) = remote_tier();
        for key in ["product:1", "product:2", "user:1"] {
            tier.set_with_ttl(key, Bytes::from_static(b"1"), metadata_with(&["p"], &[]), 60, TIMEOUT)
                .await
                .unwrap();
        }

        let mut removed = tier.delete_by_pattern("product:*", TIMEOUT).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["product:1".to_string(), "product:2".to_string()]);
        assert!(store.contains("user:1"));

        let removed = tier.delete_by_pattern("*", TIMEOUT).await.unwrap();
        assert_eq!(removed, vec!["user:1".to_string()]);
        assert!(store.contains(&tag_index_key("p")));
    }

    #[tokio::test]
    async fn test_tag_and_dependency_delete() {
        let (store, tier) = remote_tier();
        tier.set_with_ttl("a", Bytes::from_static(b"1"), metadata_with(&["red"], &[]), 60, TIMEOUT)
            .await
            .unwrap();
        tier.set_with_ttl("b", Bytes::from_static(b"2"), metadata_with(&[], &["db:x"]), 60, TIMEOUT)
            .await
            .unwrap();
        tier.set_with_ttl("c", Bytes::from_static(b"3"), metadata_with(&["blue"], &[]), 60, TIMEOUT)
            .await
            .unwrap();

        let tags: BTreeSet<String> = ["red".to_string()].into();
        let deps: BTreeSet<String> = ["db:x".to_string()].into();
        let removed = tier.delete_by_tags(&tags, &deps, TIMEOUT).await.unwrap();

        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
        assert!(store.contains("c"));
        assert!(!store.contains(&tag_index_key("red")));
        assert!(!store.contains(&dependency_index_key("db:x")));
    }

    #[tokio::test]
    async fn test_tag_delete_counts_only_live_keys() {
        let (_, tier) = remote_tier();
        tier.set_with_ttl("a", Bytes::from_static(b"1"), metadata_with(&["red"], &[]), 60, TIMEOUT)
            .await
            .unwrap();
        tier.delete("a", TIMEOUT).await.unwrap();

        let tags: BTreeSet<String> = ["red".to_string()].into();
        let removed = tier.delete_by_tags(&tags, &BTreeSet::new(), TIMEOUT).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_tagged_writes_keep_every_member() {
        let (store, tier) = remote_tier();
        store.set_latency(Duration::from_millis(10));

        let writes = (0..5).map(|i| {
            let key = format!("product:{}", i);
            let tier = &tier;
            async move {
                tier.set_with_ttl(&key, Bytes::from_static(b"1"), metadata_with(&["products"], &[]), 60, TIMEOUT)
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        assert!(tier.index_locks.is_empty());

        let tags: BTreeSet<String> = ["products".to_string()].into();
        let removed = tier.delete_by_tags(&tags, &BTreeSet::new(), TIMEOUT).await.unwrap();
        assert_eq!(removed.len(), 5);
        for i in 0..5 {
            assert!(!store.contains(&format!("product:{}", i)));
        }
        assert!(tier.index_locks.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_clamped() {
        let (store, tier) = remote_tier();
        tier.set_with_ttl("k", Bytes::from_static(b"1"), metadata_with(&["t"], &[]), u64::MAX, TIMEOUT)
            .await
            .unwrap();

        let entry = tier.get("k", TIMEOUT).await.unwrap().unwrap();
        assert_eq!(entry.metadata.ttl_secs, MAX_TTL_SECS);

        let tags: BTreeSet<String> = ["t".to_string()].into();
        let removed = tier.delete_by_tags(&tags, &BTreeSet::new(), TIMEOUT).await.unwrap();
        assert_eq!(removed, vec!["k".to_string()]);
        assert!(!store.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_reaches_store() {
        let (store, tier) = remote_tier();
        tier.set_with_ttl("k", Bytes::from_static(b"1"), metadata_with(&[], &[]), 1, TIMEOUT)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tier.purge_expired().await.unwrap(), 1);
        assert_eq!(store.stored_len(), 0);
    }

    #[tokio::test]
    async fn test_failures_open_breaker() {
        let (store, tier) = remote_tier();
        store.set_unavailable(true);

        for _ in 0..2 {
            assert_matches!(tier.get("k", TIMEOUT).await, Err(Error::RemoteUnavailable(_)));
        }
        assert_eq!(tier.breaker().state(), CircuitState::Open);
        assert_matches!(tier.get("k", TIMEOUT).await, Err(Error::CircuitOpen));
        assert_eq!(store.get_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout() {
        let (store, tier) = remote_tier();
        store.set_latency(Duration::from_secs(2));

        let result = tier.get("k", Duration::from_millis(100)).await;
        assert_matches!(result, Err(Error::Timeout { .. }));
        assert_eq!(tier.breaker().consecutive_failures(), 1);
    }
}
