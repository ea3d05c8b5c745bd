//! Redis Storage
//!
//! Remote key-value backend with native key expiry. Refresh locks use
//! `SET NX PX` with a random owner and are released by an owner-checking
//! script so a lapsed holder cannot delete a successor's lock.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use super::{is_lock_key, RecordCodec, StorageAdapter};
use crate::error::{TokenCacheError, TokenCacheResult};
use crate::types::{LockRecord, TokenRecord};

const BACKEND: &str = "redis";
const SCAN_BATCH: usize = 100;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis storage adapter.
pub struct RedisStorageAdapter {
    pool: Pool,
    codec: RecordCodec,
}

impl RedisStorageAdapter {
    /// Create a pooled adapter. Connections are opened on first use.
    pub fn connect(url: &str, pool_size: usize, codec: RecordCodec) -> TokenCacheResult<Self> {
        let mut config = Config::from_url(url);
        if let Some(ref mut pool_config) = config.pool {
            pool_config.max_size = pool_size.max(1);
        } else {
            config.pool = Some(deadpool_redis::PoolConfig::new(pool_size.max(1)));
        }

        let pool = config.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
            TokenCacheError::invalid_config(format!("invalid redis configuration: {}", e))
        })?;

        info!(pool_size, "created redis token storage pool");
        Ok(Self::with_pool(pool, codec))
    }

    /// Create an adapter over an existing pool.
    pub fn with_pool(pool: Pool, codec: RecordCodec) -> Self {
        Self { pool, codec }
    }

    async fn connection(&self) -> TokenCacheResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(backend_error)
    }
}

fn backend_error(e: impl std::fmt::Display) -> TokenCacheError {
    TokenCacheError::backend(BACKEND, e.to_string())
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl StorageAdapter for RedisStorageAdapter {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn store(
        &self,
        key: &str,
        record: &TokenRecord,
        ttl_seconds: i64,
    ) -> TokenCacheResult<bool> {
        let mut conn = self.connection().await?;

        if ttl_seconds <= 0 {
            let _: i64 = conn.del(key).await.map_err(backend_error)?;
            return Ok(true);
        }

        let encoded = self.codec.encode(record)?;
        let _: () = conn
            .set_ex(key, encoded, ttl_seconds as u64)
            .await
            .map_err(backend_error)?;

        debug!(key = %key, ttl_seconds, "stored token in redis");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = conn.get(key).await.map_err(backend_error)?;

        match data {
            Some(raw) => self.codec.decode(&raw),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> TokenCacheResult<bool> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(key).await.map_err(backend_error)?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> TokenCacheResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(backend_error)?;
        Ok(removed > 0)
    }

    async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64> {
        let mut conn = self.connection().await?;
        let pattern = escape_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_error)?;

            let tokens: Vec<String> = keys.into_iter().filter(|key| !is_lock_key(key)).collect();
            if !tokens.is_empty() {
                let count: u64 = conn.del(&tokens).await.map_err(backend_error)?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed, "cleared redis token keys");
        Ok(removed)
    }

    async fn healthy(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>> {
        let lock = LockRecord::new(key, ttl);
        let mut conn = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(&lock.lock_key)
            .arg(&lock.owner)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis().max(1)).unwrap_or(u64::MAX))
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        Ok(reply.map(|_| lock))
    }

    async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lock.lock_key)
            .arg(&lock.owner)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(removed == 1)
    }
}
