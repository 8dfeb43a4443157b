//! Redis Remote Store
//!
//! `RemoteStore` over a multiplexed, auto-reconnecting
//! [`ConnectionManager`]. Only `GET`, `SET EX`, `DEL`, `KEYS` and `PING`
//! are issued.

use crate::cache::remote::RemoteStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

fn unavailable(e: redis::RedisError) -> Error {
    Error::RemoteUnavailable(e.to_string())
}

/// Remote store backed by Redis
#[derive(Clone)]
pub struct RedisRemoteStore {
    conn: ConnectionManager,
}

impl RedisRemoteStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Connected to Redis remote store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(unavailable)?;
        Ok(value.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl_secs)
            .await
            .map_err(unavailable)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del::<_, u64>(keys).await.map_err(unavailable)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys::<_, Vec<String>>(pattern).await.map_err(unavailable)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
