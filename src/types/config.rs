//! Configuration Types
//!
//! Explicit configuration handed to the token manager and the storage
//! factory. Nothing here is global.

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use crate::error::{ConfigurationError, TokenCacheError};

/// Default scope requested when the caller passes none.
pub const DEFAULT_SCOPE: &str = "api_access";
/// Default cache key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "oauth2_token";
/// Default scope segment of the cache key.
pub const DEFAULT_SCOPE_PREFIX: &str = "scopes";
/// Default environment name.
pub const DEFAULT_ENVIRONMENT: &str = "production";
/// Default HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Tokens are dropped this long before their declared expiry.
pub const DEFAULT_SAFETY_BUFFER: Duration = Duration::from_secs(10);
/// Default lifetime of a refresh lock.
///
/// No longer than the default retry window, so a waiter outlives a lock
/// abandoned by a crashed holder.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
/// Default number of lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 50;
/// Default delay between lock acquisition attempts.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Token cache configuration.
#[derive(Clone, Debug)]
pub struct TokenCacheConfig {
    /// OAuth2 client identifier.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: SecretString,
    /// Token endpoint URL.
    pub token_endpoint: String,
    /// Environment name, part of every cache key.
    pub environment: String,
    /// Scope used when the caller requests none. Empty clears the default.
    pub default_scope: String,
    /// Optional allowlist; `None` permits every scope.
    pub allowed_scopes: Option<Vec<String>>,
    /// HTTP request timeout.
    pub timeout: Duration,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// Storage backend settings.
    pub storage: StorageConfig,
    /// Cache key and locking settings.
    pub cache: CacheConfig,
    /// Encryption settings.
    pub encryption: EncryptionConfig,
}

impl TokenCacheConfig {
    /// Load configuration from environment variables.
    ///
    /// Required: `OAUTH2_CLIENT_ID`, `OAUTH2_CLIENT_SECRET`, `OAUTH2_TOKEN_ENDPOINT`.
    /// Optional: `OAUTH2_ENVIRONMENT`, `OAUTH2_DEFAULT_SCOPE`, `OAUTH2_ALLOWED_SCOPES`,
    /// `TOKEN_CACHE_ADAPTER`, `TOKEN_CACHE_URL`, `TOKEN_CACHE_TABLE_NAME`,
    /// `TOKEN_CACHE_REGION`, `TOKEN_CACHE_ENDPOINT`, `TOKEN_CACHE_KEY_PREFIX`,
    /// `TOKEN_CACHE_SCOPE_PREFIX`, `TOKEN_CACHE_WARN_ON_LOCAL_STORAGE`,
    /// `TOKEN_CACHE_ENCRYPTION_KEY`, `TOKEN_CACHE_ENCRYPTION_ENABLED`.
    pub fn from_env() -> Result<Self, TokenCacheError> {
        fn required(name: &str) -> Result<String, TokenCacheError> {
            std::env::var(name).map_err(|_| {
                TokenCacheError::Configuration(ConfigurationError::MissingRequired {
                    field: name.to_string(),
                })
            })
        }
        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let flag = |name: &str| {
            optional(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        };

        let mut builder = crate::builders::token_cache_config()
            .client_id(required("OAUTH2_CLIENT_ID")?)
            .client_secret(required("OAUTH2_CLIENT_SECRET")?)
            .token_endpoint(required("OAUTH2_TOKEN_ENDPOINT")?);

        if let Some(environment) = optional("OAUTH2_ENVIRONMENT") {
            builder = builder.environment(environment);
        }
        if let Some(scope) = std::env::var("OAUTH2_DEFAULT_SCOPE").ok() {
            builder = builder.default_scope(scope);
        }
        if let Some(scopes) = optional("OAUTH2_ALLOWED_SCOPES") {
            builder = builder.allowed_scopes(scopes.split_whitespace().map(String::from).collect());
        }
        if let Some(adapter) = optional("TOKEN_CACHE_ADAPTER") {
            builder = builder.storage_adapter(adapter);
        }
        if let Some(url) = optional("TOKEN_CACHE_URL") {
            builder = builder.storage_url(url);
        }
        if let Some(table) = optional("TOKEN_CACHE_TABLE_NAME") {
            builder = builder.table_name(table);
        }
        if let Some(region) = optional("TOKEN_CACHE_REGION") {
            builder = builder.region(region);
        }
        if let Some(endpoint) = optional("TOKEN_CACHE_ENDPOINT") {
            builder = builder.storage_endpoint(endpoint);
        }
        if let Some(prefix) = optional("TOKEN_CACHE_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }
        if let Some(prefix) = optional("TOKEN_CACHE_SCOPE_PREFIX") {
            builder = builder.scope_prefix(prefix);
        }
        if let Some(warn) = flag("TOKEN_CACHE_WARN_ON_LOCAL_STORAGE") {
            builder = builder.warn_on_local_storage(warn);
        }
        if let Some(key) = optional("TOKEN_CACHE_ENCRYPTION_KEY") {
            builder = builder.encryption_key(key);
        }
        if let Some(enabled) = flag("TOKEN_CACHE_ENCRYPTION_ENABLED") {
            builder = builder.encryption_enabled(enabled);
        }

        builder.build()
    }

    /// Encryption key to use, if encryption is enabled and a key is present.
    pub fn active_encryption_key(&self) -> Option<&SecretString> {
        if !self.encryption.enabled {
            return None;
        }
        self.encryption
            .key
            .as_ref()
            .filter(|k| !k.expose_secret().is_empty())
    }
}

/// Storage backend settings.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Adapter name: `memory`, `redis`, `database` (`postgres`), `dynamodb`.
    pub adapter: String,
    /// Connection URL (redis, database).
    pub url: Option<String>,
    /// Connection pool size.
    pub pool_size: usize,
    /// Table holding cached tokens (database, dynamodb).
    pub table_name: Option<String>,
    /// Table holding lock rows (database).
    pub lock_table_name: Option<String>,
    /// AWS region (dynamodb).
    pub region: Option<String>,
    /// Endpoint override (dynamodb, e.g. a local emulator).
    pub endpoint: Option<String>,
    /// Static AWS access key id (dynamodb); falls back to `AWS_ACCESS_KEY_ID`.
    pub access_key_id: Option<String>,
    /// Static AWS secret (dynamodb); falls back to `AWS_SECRET_ACCESS_KEY`.
    pub secret_access_key: Option<SecretString>,
    /// Optional AWS session token.
    pub session_token: Option<SecretString>,
    /// Partition key attribute name (dynamodb).
    pub hash_key: String,
    /// Native expiration attribute name (dynamodb).
    pub ttl_attribute: String,
    /// Create tables on startup (database).
    pub auto_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            adapter: "memory".to_string(),
            url: None,
            pool_size: 8,
            table_name: None,
            lock_table_name: None,
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            hash_key: "token_key".to_string(),
            ttl_attribute: "ttl".to_string(),
            auto_migrate: false,
        }
    }
}

/// Cache key and refresh-lock settings.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// First cache key segment.
    pub key_prefix: String,
    /// Second cache key segment.
    pub scope_prefix: String,
    /// Tokens are treated as expired this long before their declared expiry.
    pub safety_buffer: Duration,
    /// Warn once per process when the process-local adapter is selected.
    pub warn_on_local_storage: bool,
    /// Lifetime of a refresh lock.
    pub lock_ttl: Duration,
    /// Lock acquisition attempts before giving up.
    pub lock_retry_attempts: u32,
    /// Fixed delay between lock acquisition attempts.
    pub lock_retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scope_prefix: DEFAULT_SCOPE_PREFIX.to_string(),
            safety_buffer: DEFAULT_SAFETY_BUFFER,
            warn_on_local_storage: true,
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
        }
    }
}

/// Encryption settings.
#[derive(Clone, Default)]
pub struct EncryptionConfig {
    /// Encrypt records before they reach the backend.
    pub enabled: bool,
    /// Passphrase the record keys are derived from.
    pub key: Option<SecretString>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
