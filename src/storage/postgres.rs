//! PostgreSQL Storage
//!
//! Relational backend. Expiry is an explicit column filtered on read and
//! swept by [`StorageAdapter::cleanup_expired`]. Refresh locks are rows in a
//! separate table; the primary key makes acquisition atomic.

use async_trait::async_trait;
use sqlx_core::pool::PoolOptions;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgPool, Postgres};
use std::time::Duration;
use tracing::{debug, info};

use super::{RecordCodec, StorageAdapter};
use crate::error::{ConfigurationError, TokenCacheError, TokenCacheResult};
use crate::types::{LockRecord, TokenRecord};

const BACKEND: &str = "database";

/// Default token table.
pub const DEFAULT_TABLE: &str = "token_cache";
/// Default lock table.
pub const DEFAULT_LOCK_TABLE: &str = "token_cache_locks";

/// PostgreSQL storage adapter.
pub struct PostgresStorageAdapter {
    pool: PgPool,
    table: String,
    lock_table: String,
    codec: RecordCodec,
}

impl PostgresStorageAdapter {
    /// Connect a pool and optionally create the schema.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        table: Option<&str>,
        lock_table: Option<&str>,
        auto_migrate: bool,
        codec: RecordCodec,
    ) -> TokenCacheResult<Self> {
        let pool = PoolOptions::<Postgres>::new()
            .max_connections(pool_size.max(1) as u32)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(db_error)?;

        let adapter = Self::with_pool(pool, table, lock_table, codec)?;
        if auto_migrate {
            adapter.ensure_schema().await?;
        }

        info!(table = %adapter.table, lock_table = %adapter.lock_table, "connected database token storage");
        Ok(adapter)
    }

    /// Create an adapter over an existing pool.
    pub fn with_pool(
        pool: PgPool,
        table: Option<&str>,
        lock_table: Option<&str>,
        codec: RecordCodec,
    ) -> TokenCacheResult<Self> {
        let table = table.unwrap_or(DEFAULT_TABLE);
        let lock_table = lock_table.unwrap_or(DEFAULT_LOCK_TABLE);
        validate_identifier(table)?;
        validate_identifier(lock_table)?;

        Ok(Self {
            pool,
            table: table.to_string(),
            lock_table: lock_table.to_string(),
            codec,
        })
    }

    /// Create the token and lock tables if they do not exist.
    pub async fn ensure_schema(&self) -> TokenCacheResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    cache_key TEXT PRIMARY KEY,
                    token_data TEXT NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (expires_at)",
                index_name(&self.table),
                self.table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    lock_key TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.lock_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (expires_at)",
                index_name(&self.lock_table),
                self.lock_table
            ),
        ];

        for statement in &statements {
            query(statement).execute(&self.pool).await.map_err(db_error)?;
        }

        debug!(table = %self.table, "token cache schema ensured");
        Ok(())
    }
}

fn db_error(e: sqlx_core::Error) -> TokenCacheError {
    TokenCacheError::backend(BACKEND, e.to_string())
}

fn is_unique_violation(e: &sqlx_core::Error) -> bool {
    match e {
        sqlx_core::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Accept `table` or `schema.table`, each part a plain SQL identifier.
fn validate_identifier(name: &str) -> TokenCacheResult<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(TokenCacheError::Configuration(ConfigurationError::InvalidConfig {
            message: format!("invalid table name '{}'", name),
        }))
    }
}

fn index_name(table: &str) -> String {
    format!("idx_{}_expires_at", table.replace('.', "_"))
}

/// Escape `LIKE` wildcards; pairs with `ESCAPE '\'`.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[async_trait]
impl StorageAdapter for PostgresStorageAdapter {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn store(
        &self,
        key: &str,
        record: &TokenRecord,
        ttl_seconds: i64,
    ) -> TokenCacheResult<bool> {
        let encoded = self.codec.encode(record)?;
        // A non-positive TTL is written already expired.
        let ttl = if ttl_seconds <= 0 { -1.0 } else { ttl_seconds as f64 };

        let sql = format!(
            "INSERT INTO {} (cache_key, token_data, expires_at, created_at, updated_at)
             VALUES ($1, $2, NOW() + make_interval(secs => $3), NOW(), NOW())
             ON CONFLICT (cache_key) DO UPDATE
             SET token_data = EXCLUDED.token_data,
                 expires_at = EXCLUDED.expires_at,
                 updated_at = NOW()",
            self.table
        );

        query(&sql)
            .bind(key)
            .bind(&encoded)
            .bind(ttl)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        debug!(key = %key, ttl_seconds, "stored token in database");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>> {
        let sql = format!(
            "SELECT token_data FROM {} WHERE cache_key = $1 AND expires_at > NOW()",
            self.table
        );

        let data: Option<String> = query_scalar(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        match data {
            Some(raw) => self.codec.decode(&raw),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> TokenCacheResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE cache_key = $1 AND expires_at > NOW())",
            self.table
        );

        let exists: bool = query_scalar(&sql)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> TokenCacheResult<bool> {
        let sql = format!("DELETE FROM {} WHERE cache_key = $1", self.table);
        let result = query(&sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64> {
        let sql = format!(
            r"DELETE FROM {} WHERE cache_key LIKE $1 ESCAPE '\'",
            self.table
        );
        let result = query(&sql)
            .bind(like_prefix(prefix))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn healthy(&self) -> bool {
        query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>> {
        let lock = LockRecord::new(key, ttl);

        let stale = format!(
            "DELETE FROM {} WHERE lock_key = $1 AND expires_at <= NOW()",
            self.lock_table
        );
        query(&stale)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        let insert = format!(
            "INSERT INTO {} (lock_key, owner, expires_at, created_at)
             VALUES ($1, $2, NOW() + make_interval(secs => $3), NOW())",
            self.lock_table
        );
        let result = query(&insert)
            .bind(key)
            .bind(&lock.owner)
            .bind(ttl.as_secs_f64())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(Some(lock)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE lock_key = $1 AND owner = $2",
            self.lock_table
        );
        let result = query(&sql)
            .bind(&lock.lock_key)
            .bind(&lock.owner)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired(&self) -> TokenCacheResult<u64> {
        let mut removed = 0;
        for table in [&self.table, &self.lock_table] {
            let sql = format!("DELETE FROM {} WHERE expires_at <= NOW()", table);
            let result = query(&sql)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
            removed += result.rows_affected();
        }

        if removed > 0 {
            info!(removed, "removed expired database token rows");
        }
        Ok(removed)
    }
}
