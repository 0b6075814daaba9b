//! Key-value store seam
//!
//! The cache talks to its backing store through [`CacheStore`]. Besides plain
//! GET/SET/TTL the store must offer an atomic set-if-absent with expiry and a
//! compare-and-delete, which is what the distributed lock is built on.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CacheError;

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`.
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Operations the cache needs from its backing store.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Raw payload stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` at `key` with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remaining TTL in seconds. `None` when the key is missing or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Set `key` to `value` with a TTL only if it does not exist yet.
    /// Returns whether the value was written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64)
    -> Result<bool, CacheError>;

    /// Delete `key` only if it currently holds `expected`. Returns whether a
    /// key was deleted.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError>;
}

/// Envelope written to the store for every cache entry.
///
/// `Absent` records that a loader confirmed there is no value, so readers
/// can tell a cached absence from a key that was never loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredEntry {
    Present(serde_json::Value),
    Absent,
}

impl StoredEntry {
    pub fn encode(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// [`CacheStore`] backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn new(redis_client: redis::Client) -> Result<Self, redis::RedisError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self::from_manager(redis))
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(redis: redis::aio::ConnectionManager) -> Self {
        Self {
            redis,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE_SCRIPT),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let mut conn = self.redis.clone();
        // -2: missing key, -1: no expiry
        let ttl = conn.ttl::<_, i64>(key).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        debug!("SET NX for {}: {:?}", key, reply);
        Ok(reply.is_some())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}
