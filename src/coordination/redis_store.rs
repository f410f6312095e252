//! Redis-backed coordination store.
//!
//! Keys map one-to-one onto Redis keys, so any other process speaking the same
//! namespace (`task-lock:{key}`, `task-completed:{key}`, ...) coordinates with
//! this one. Expiry uses millisecond TTLs (`PX`).

use super::store::CoordinationStore;
use crate::error::StoreError;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Atomically delete KEYS[1] if its value equals ARGV[1]
const SCRIPT_DELETE_IF_EQUALS: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// [`CoordinationStore`] backed by Redis
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically)
    redis: ConnectionManager,
    delete_if_equals: redis::Script,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Use an existing connection manager
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            delete_if_equals: redis::Script::new(SCRIPT_DELETE_IF_EQUALS),
        }
    }
}

/// Redis rejects `PX 0`; anything shorter than a millisecond rounds up
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait::async_trait]
impl CoordinationStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        // SET NX replies OK on success and nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
