//! Token Storage
//!
//! One storage contract implemented by every cache backend, the shared
//! record codec, and the distributed lock helpers built on top of it.
//!
//! Backends:
//!
//! - **memory**: process-local map, always available
//! - **redis**: remote key-value store with native expiry (feature `redis`)
//! - **database**: PostgreSQL with explicit lock rows (feature `postgres`)
//! - **dynamodb**: DynamoDB with conditional writes (feature `dynamodb`)

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::encryption::{self, EncryptedEnvelope};
use crate::error::{ServerError, TokenCacheError, TokenCacheResult};
use crate::types::{CacheConfig, LockRecord, TokenCacheConfig, TokenRecord};

pub mod factory;
pub mod memory;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use factory::{AdapterFactory, AdapterInfo};
pub use memory::MemoryStorageAdapter;

#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbStorageAdapter;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorageAdapter;
#[cfg(feature = "redis")]
pub use self::redis::RedisStorageAdapter;

/// Suffix appended to a cache key to form its refresh lock key.
pub const LOCK_SUFFIX: &str = ":lock";

/// Lock key guarding refreshes of `cache_key`.
pub fn lock_key(cache_key: &str) -> String {
    format!("{}{}", cache_key, LOCK_SUFFIX)
}

/// Whether `key` names a refresh lock rather than a cached token.
pub fn is_lock_key(key: &str) -> bool {
    key.ends_with(LOCK_SUFFIX)
}

/// Storage backend interface.
///
/// Records are whole values: a reader sees either the previous record or the
/// new one, never a mix. Implementations convert backend-native failures
/// into [`TokenCacheError`] before returning.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Adapter name as accepted by the factory.
    fn name(&self) -> &'static str;

    /// Store a record. `ttl_seconds <= 0` makes the key absent immediately.
    async fn store(&self, key: &str, record: &TokenRecord, ttl_seconds: i64)
        -> TokenCacheResult<bool>;

    /// Retrieve a live record.
    async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>>;

    /// Check whether a live record exists.
    async fn exists(&self, key: &str) -> TokenCacheResult<bool>;

    /// Delete a record. Returns whether something was removed.
    async fn delete(&self, key: &str) -> TokenCacheResult<bool>;

    /// Delete every record whose key starts with `prefix`. Returns the count.
    async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64>;

    /// Check that the backend is reachable.
    async fn healthy(&self) -> bool;

    /// Whether the backend can coordinate refreshes across callers.
    fn supports_locking(&self) -> bool {
        false
    }

    /// Try once to take the lock. `None` means another owner holds it.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>> {
        let _ = (key, ttl);
        Err(TokenCacheError::invalid_config(format!(
            "storage adapter '{}' does not support locking",
            self.name()
        )))
    }

    /// Release a lock. Only the owner recorded in `lock` can release it.
    async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool> {
        let _ = lock;
        Ok(false)
    }

    /// Remove expired records from backends without native expiry.
    async fn cleanup_expired(&self) -> TokenCacheResult<u64> {
        Ok(0)
    }
}

/// Bounded fixed-delay lock acquisition policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    /// Lock lifetime.
    pub ttl: Duration,
    /// Acquisition attempts before giving up.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl LockPolicy {
    /// Create a lock policy.
    pub fn new(ttl: Duration, attempts: u32, delay: Duration) -> Self {
        Self {
            ttl,
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Lock policy from cache settings.
    pub fn from_cache_config(cache: &CacheConfig) -> Self {
        Self::new(cache.lock_ttl, cache.lock_retry_attempts, cache.lock_retry_delay)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from_cache_config(&CacheConfig::default())
    }
}

/// Acquire a lock, retrying with the policy's fixed delay.
///
/// Fails with `ServerError::LockTimeout` once every attempt saw the lock held.
pub async fn acquire_lock_with_retry(
    adapter: &dyn StorageAdapter,
    key: &str,
    policy: &LockPolicy,
) -> TokenCacheResult<LockRecord> {
    for attempt in 1..=policy.attempts {
        if let Some(lock) = adapter.acquire_lock(key, policy.ttl).await? {
            debug!(lock_key = %key, attempt, "lock acquired");
            return Ok(lock);
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Err(TokenCacheError::Server(ServerError::LockTimeout {
        key: key.to_string(),
        attempts: policy.attempts,
    }))
}

/// Held lock that is released when dropped.
///
/// [`LockGuard::release`] releases inline. Dropping an unreleased guard, for
/// example when the owning future is cancelled, hands the release to a
/// spawned task so the lock does not sit out its full TTL.
pub struct LockGuard {
    adapter: Arc<dyn StorageAdapter>,
    lock: Option<LockRecord>,
}

impl LockGuard {
    /// Guard a lock acquired from `adapter`.
    pub fn new(adapter: Arc<dyn StorageAdapter>, lock: LockRecord) -> Self {
        Self {
            adapter,
            lock: Some(lock),
        }
    }

    /// The guarded lock.
    pub fn lock(&self) -> Option<&LockRecord> {
        self.lock.as_ref()
    }

    /// Release now.
    pub async fn release(mut self) {
        if let Some(lock) = self.lock.as_ref() {
            release_quietly(self.adapter.as_ref(), lock).await;
        }
        self.lock = None;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(lock_key = %lock.lock_key, "releasing lock from dropped guard");
                let adapter = self.adapter.clone();
                handle.spawn(async move {
                    release_quietly(adapter.as_ref(), &lock).await;
                });
            }
            Err(_) => warn!(
                lock_key = %lock.lock_key,
                "lock guard dropped outside a runtime; the lock lapses with its TTL"
            ),
        }
    }
}

/// Run `body` while holding the lock on `key`.
///
/// The lock is released whether `body` succeeds, fails or is cancelled.
/// Backends without locking run `body` directly.
pub async fn with_lock<F, Fut, R>(
    adapter: &Arc<dyn StorageAdapter>,
    key: &str,
    policy: &LockPolicy,
    body: F,
) -> TokenCacheResult<R>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = TokenCacheResult<R>> + Send,
    R: Send,
{
    if !adapter.supports_locking() {
        return body().await;
    }

    let lock = acquire_lock_with_retry(adapter.as_ref(), key, policy).await?;
    let guard = LockGuard::new(adapter.clone(), lock);
    let result = body().await;
    guard.release().await;
    result
}

/// Release a lock, logging instead of failing. A lost release lapses with the TTL.
pub async fn release_quietly(adapter: &dyn StorageAdapter, lock: &LockRecord) {
    match adapter.release_lock(lock).await {
        Ok(true) => debug!(lock_key = %lock.lock_key, "lock released"),
        Ok(false) => warn!(
            lock_key = %lock.lock_key,
            "lock was no longer held at release; it expired or was taken over"
        ),
        Err(e) => warn!(lock_key = %lock.lock_key, error = %e, "failed to release lock"),
    }
}

/// Serializes records for storage, encrypting them when a key is configured.
#[derive(Clone, Default)]
pub struct RecordCodec {
    key: Option<SecretString>,
}

impl RecordCodec {
    /// Create a codec; `Some(key)` enables encryption.
    pub fn new(key: Option<SecretString>) -> Self {
        Self { key }
    }

    /// Codec storing plain JSON.
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// Codec for the configured encryption settings.
    pub fn from_config(config: &TokenCacheConfig) -> Self {
        Self::new(config.active_encryption_key().cloned())
    }

    /// Whether records are encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Encode a record to its stored string form.
    pub fn encode(&self, record: &TokenRecord) -> TokenCacheResult<String> {
        let rendered = match &self.key {
            Some(key) => {
                let envelope = encryption::encrypt_record(record, key.expose_secret())?;
                serde_json::to_string(&envelope)
            }
            None => serde_json::to_string(record),
        };

        rendered.map_err(|e| {
            TokenCacheError::invalid_config(format!("failed to serialize record: {}", e))
        })
    }

    /// Decode a stored string.
    ///
    /// Unreadable plaintext and plaintext records met while encryption is
    /// enabled are treated as misses so the next refresh overwrites them.
    /// Envelope failures propagate.
    pub fn decode(&self, raw: &str) -> TokenCacheResult<Option<TokenRecord>> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "discarding unreadable cached record");
                return Ok(None);
            }
        };

        if EncryptedEnvelope::is_envelope(&value) {
            let key = self.key.as_ref().ok_or_else(|| {
                TokenCacheError::invalid_config(
                    "cached record is encrypted but no encryption key is configured",
                )
            })?;
            let plain = encryption::decrypt_value(&value, key.expose_secret())?;
            return serde_json::from_value(plain).map(Some).map_err(|e| {
                TokenCacheError::invalid_config(format!(
                    "decrypted record has unexpected shape: {}",
                    e
                ))
            });
        }

        if self.is_encrypted() {
            warn!("ignoring plaintext cached record while encryption is enabled");
            return Ok(None);
        }

        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable cached record");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use crate::types::TokenResponse;
    use std::collections::HashMap;

    const KEY: &str = "Abcdefgh1234567890abcdefgh123456";

    fn record() -> TokenRecord {
        TokenRecord::from_response(
            &TokenResponse {
                access_token: "tok".to_string(),
                token_type: "Bearer".to_string(),
                expires_in: Some(3600),
                scope: None,
                extra: HashMap::new(),
            },
            "client",
            "a_1".to_string(),
            Duration::from_secs(10),
        )
    }

    fn encrypted() -> RecordCodec {
        RecordCodec::new(Some(SecretString::new(KEY.to_string())))
    }

    #[test]
    fn test_plaintext_codec_round_trip() {
        let codec = RecordCodec::plaintext();
        let raw = codec.encode(&record()).unwrap();
        assert!(raw.contains("\"access_token\":\"tok\""));
        assert_eq!(codec.decode(&raw).unwrap(), Some(record()));
    }

    #[test]
    fn test_encrypted_codec_hides_token() {
        let codec = encrypted();
        let rec = record();
        let raw = codec.encode(&rec).unwrap();
        assert!(!raw.contains("tok\""));
        assert!(raw.contains("\"encrypted\":true"));
        assert_eq!(codec.decode(&raw).unwrap(), Some(rec));
    }

    #[test]
    fn test_plaintext_refused_when_encrypted() {
        let raw = RecordCodec::plaintext().encode(&record()).unwrap();
        assert_eq!(encrypted().decode(&raw).unwrap(), None);
    }

    #[test]
    fn test_envelope_without_key_is_configuration_error() {
        let raw = encrypted().encode(&record()).unwrap();
        assert!(matches!(
            RecordCodec::plaintext().decode(&raw),
            Err(TokenCacheError::Configuration(ConfigurationError::InvalidConfig { .. }))
        ));
    }

    #[test]
    fn test_envelope_with_wrong_key_is_unauthorized() {
        let raw = encrypted().encode(&record()).unwrap();
        let other = RecordCodec::new(Some(SecretString::new(
            "Zyxwvuts0987654321zyxwvuts098765".to_string(),
        )));
        assert!(matches!(
            other.decode(&raw),
            Err(TokenCacheError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_garbage_is_a_miss() {
        assert_eq!(RecordCodec::plaintext().decode("not json").unwrap(), None);
        assert_eq!(RecordCodec::plaintext().decode("{\"x\":1}").unwrap(), None);
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("a:b"), "a:b:lock");
        assert!(is_lock_key(&lock_key("a:b")));
        assert!(!is_lock_key("a:b"));
        assert!(!is_lock_key("a:lockless"));
    }

    #[tokio::test]
    async fn test_with_lock_runs_body_and_releases() {
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(MemoryStorageAdapter::new(RecordCodec::plaintext()));
        let policy = LockPolicy::new(Duration::from_secs(5), 3, Duration::from_millis(10));

        let value = with_lock(&adapter, "k:lock", &policy, || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // Released: a fresh acquire succeeds immediately.
        let lock = adapter
            .acquire_lock("k:lock", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(MemoryStorageAdapter::new(RecordCodec::plaintext()));
        let policy = LockPolicy::new(Duration::from_secs(5), 1, Duration::from_millis(10));

        let result: TokenCacheResult<()> = with_lock(&adapter, "k:lock", &policy, || async {
            Err(TokenCacheError::unauthorized("nope"))
        })
        .await;
        assert!(result.is_err());

        assert!(adapter
            .acquire_lock("k:lock", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_cancelled_body_still_releases_lock() {
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(MemoryStorageAdapter::new(RecordCodec::plaintext()));
        let policy = LockPolicy::new(Duration::from_secs(30), 1, Duration::from_millis(10));

        let pending = with_lock(&adapter, "k:lock", &policy, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), pending)
            .await
            .is_err());

        // Let the spawned release run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(adapter
            .acquire_lock("k:lock", Duration::from_secs(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_released_guard_does_not_release_again() {
        let adapter: Arc<dyn StorageAdapter> =
            Arc::new(MemoryStorageAdapter::new(RecordCodec::plaintext()));
        let lock = adapter
            .acquire_lock("k:lock", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let guard = LockGuard::new(adapter.clone(), lock);
        assert_eq!(guard.lock().map(|l| l.lock_key.as_str()), Some("k:lock"));
        guard.release().await;

        let successor = adapter
            .acquire_lock("k:lock", Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(successor.is_some());
        assert!(adapter
            .acquire_lock("k:lock", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out_after_attempts() {
        let adapter = MemoryStorageAdapter::new(RecordCodec::plaintext());
        let _held = adapter
            .acquire_lock("k:lock", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let policy = LockPolicy::new(Duration::from_secs(5), 3, Duration::from_millis(5));
        match acquire_lock_with_retry(&adapter, "k:lock", &policy).await {
            Err(TokenCacheError::Server(ServerError::LockTimeout { key, attempts })) => {
                assert_eq!(key, "k:lock");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_policy_clamps_attempts() {
        let policy = LockPolicy::new(Duration::from_secs(1), 0, Duration::ZERO);
        assert_eq!(policy.attempts, 1);
        assert_eq!(LockPolicy::default().attempts, 50);
    }
}
