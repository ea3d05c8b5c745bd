//! Configuration Builder
//!
//! Fluent builder for token cache configuration.

use secrecy::SecretString;
use std::time::Duration;
use url::Url;

use crate::error::{ConfigurationError, TokenCacheError};
use crate::types::{
    CacheConfig, EncryptionConfig, StorageConfig, TokenCacheConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_ENVIRONMENT, DEFAULT_SCOPE, DEFAULT_TIMEOUT,
};

/// Token cache configuration builder.
#[derive(Default)]
pub struct TokenCacheConfigBuilder {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    token_endpoint: Option<String>,
    environment: Option<String>,
    default_scope: Option<String>,
    allowed_scopes: Option<Vec<String>>,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    storage: StorageConfig,
    cache: CacheConfig,
    encryption: EncryptionConfig,
}

impl TokenCacheConfigBuilder {
    /// Create new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set client ID.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set client secret.
    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(SecretString::new(client_secret.into()));
        self
    }

    /// Set token endpoint.
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    /// Set environment name (part of every cache key).
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Set default scope. An empty string clears the default.
    pub fn default_scope(mut self, scope: impl Into<String>) -> Self {
        self.default_scope = Some(scope.into());
        self
    }

    /// Restrict requestable scopes.
    pub fn allowed_scopes(mut self, scopes: Vec<String>) -> Self {
        self.allowed_scopes = Some(scopes);
        self
    }

    /// Set request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Select storage adapter by name.
    pub fn storage_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.storage.adapter = adapter.into();
        self
    }

    /// Set storage connection URL.
    pub fn storage_url(mut self, url: impl Into<String>) -> Self {
        self.storage.url = Some(url.into());
        self
    }

    /// Set storage pool size.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.storage.pool_size = size;
        self
    }

    /// Set token table name.
    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.storage.table_name = Some(table.into());
        self
    }

    /// Set lock table name.
    pub fn lock_table_name(mut self, table: impl Into<String>) -> Self {
        self.storage.lock_table_name = Some(table.into());
        self
    }

    /// Set storage region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.storage.region = Some(region.into());
        self
    }

    /// Override the storage service endpoint.
    pub fn storage_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.storage.endpoint = Some(endpoint.into());
        self
    }

    /// Set static storage credentials.
    pub fn storage_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.storage.access_key_id = Some(access_key_id.into());
        self.storage.secret_access_key = Some(SecretString::new(secret_access_key.into()));
        self
    }

    /// Create tables on startup.
    pub fn auto_migrate(mut self, enable: bool) -> Self {
        self.storage.auto_migrate = enable;
        self
    }

    /// Replace all storage settings.
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set cache key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache.key_prefix = prefix.into();
        self
    }

    /// Set cache key scope prefix.
    pub fn scope_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache.scope_prefix = prefix.into();
        self
    }

    /// Set expiry safety buffer.
    pub fn safety_buffer(mut self, buffer: Duration) -> Self {
        self.cache.safety_buffer = buffer;
        self
    }

    /// Enable or disable the process-local storage warning.
    pub fn warn_on_local_storage(mut self, warn: bool) -> Self {
        self.cache.warn_on_local_storage = warn;
        self
    }

    /// Set refresh lock lifetime.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.cache.lock_ttl = ttl;
        self
    }

    /// Set lock retry policy.
    pub fn lock_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.cache.lock_retry_attempts = attempts;
        self.cache.lock_retry_delay = delay;
        self
    }

    /// Set encryption key; enables encryption.
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption.key = Some(SecretString::new(key.into()));
        self.encryption.enabled = true;
        self
    }

    /// Enable or disable encryption explicitly.
    pub fn encryption_enabled(mut self, enabled: bool) -> Self {
        self.encryption.enabled = enabled;
        self
    }

    /// Build the token cache configuration.
    pub fn build(self) -> Result<TokenCacheConfig, TokenCacheError> {
        let client_id = self.client_id.filter(|id| !id.is_empty()).ok_or_else(|| {
            TokenCacheError::Configuration(ConfigurationError::MissingRequired {
                field: "client_id".to_string(),
            })
        })?;

        let client_secret = self.client_secret.ok_or_else(|| {
            TokenCacheError::Configuration(ConfigurationError::MissingRequired {
                field: "client_secret".to_string(),
            })
        })?;

        let token_endpoint = self.token_endpoint.ok_or_else(|| {
            TokenCacheError::Configuration(ConfigurationError::MissingRequired {
                field: "token_endpoint".to_string(),
            })
        })?;

        match Url::parse(&token_endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(TokenCacheError::Configuration(
                    ConfigurationError::InvalidEndpoint {
                        url: token_endpoint,
                    },
                ))
            }
        }

        if self.cache.lock_retry_attempts == 0 {
            return Err(TokenCacheError::invalid_config(
                "lock_retry_attempts must be at least 1",
            ));
        }

        Ok(TokenCacheConfig {
            client_id,
            client_secret,
            token_endpoint,
            environment: self
                .environment
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            default_scope: self
                .default_scope
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            allowed_scopes: self.allowed_scopes,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            storage: self.storage,
            cache: self.cache,
            encryption: self.encryption,
        })
    }
}

/// Create a new token cache configuration builder.
pub fn token_cache_config() -> TokenCacheConfigBuilder {
    TokenCacheConfigBuilder::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_builder_success() {
        let config = TokenCacheConfigBuilder::new()
            .client_id("test-client")
            .client_secret("test-secret")
            .token_endpoint("https://auth.example.com/oauth2/token")
            .environment("sandbox")
            .storage_adapter("redis")
            .storage_url("redis://localhost:6379")
            .build()
            .unwrap();

        assert_eq!(config.client_id, "test-client");
        assert_eq!(config.client_secret.expose_secret(), "test-secret");
        assert_eq!(config.environment, "sandbox");
        assert_eq!(config.default_scope, DEFAULT_SCOPE);
        assert_eq!(config.storage.adapter, "redis");
        assert!(!config.encryption.enabled);
    }

    #[test]
    fn test_builder_missing_client_id() {
        let result = TokenCacheConfigBuilder::new()
            .client_secret("test-secret")
            .token_endpoint("https://auth.example.com/token")
            .build();

        assert!(matches!(
            result,
            Err(TokenCacheError::Configuration(
                ConfigurationError::MissingRequired { .. }
            ))
        ));
    }

    #[test]
    fn test_builder_rejects_invalid_endpoint() {
        let result = TokenCacheConfigBuilder::new()
            .client_id("test-client")
            .client_secret("test-secret")
            .token_endpoint("not a url")
            .build();

        assert!(matches!(
            result,
            Err(TokenCacheError::Configuration(
                ConfigurationError::InvalidEndpoint { .. }
            ))
        ));
    }

    #[test]
    fn test_encryption_key_enables_encryption() {
        let config = TokenCacheConfigBuilder::new()
            .client_id("test-client")
            .client_secret("test-secret")
            .token_endpoint("https://auth.example.com/token")
            .encryption_key("Abcdefgh1234567890abcdefgh123456")
            .build()
            .unwrap();

        assert!(config.encryption.enabled);
        assert!(config.active_encryption_key().is_some());
    }

    #[test]
    fn test_empty_default_scope_is_kept() {
        let config = TokenCacheConfigBuilder::new()
            .client_id("test-client")
            .client_secret("test-secret")
            .token_endpoint("https://auth.example.com/token")
            .default_scope("")
            .build()
            .unwrap();

        assert_eq!(config.default_scope, "");
    }
}
