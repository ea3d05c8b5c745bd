//! Storage Adapter Factory
//!
//! Validates storage configuration and builds the selected backend.

use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::{MemoryStorageAdapter, RecordCodec, StorageAdapter};
use crate::core::encryption;
use crate::error::{ConfigurationError, TokenCacheError, TokenCacheResult};
use crate::types::TokenCacheConfig;

/// Adapter names accepted by the factory.
pub const ADAPTER_NAMES: [&str; 4] = ["memory", "redis", "database", "dynamodb"];

/// Static description of a storage backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Canonical adapter name.
    pub name: &'static str,
    /// Human readable description.
    pub description: &'static str,
    /// Cargo feature that enables the backend, if any.
    pub feature: Option<&'static str>,
    /// Whether the backend is compiled in.
    pub available: bool,
    /// Whether the backend is shared across processes.
    pub shared: bool,
    /// Whether the backend expires entries natively.
    pub native_ttl: bool,
    /// Whether the backend supports refresh locks.
    pub supports_locking: bool,
}

/// Storage adapter factory.
pub struct AdapterFactory;

impl AdapterFactory {
    /// Canonical adapter name; `postgres` and `postgresql` alias `database`.
    pub fn canonical_name(name: &str) -> Option<&'static str> {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => Some("memory"),
            "redis" => Some("redis"),
            "database" | "postgres" | "postgresql" => Some("database"),
            "dynamodb" => Some("dynamodb"),
            _ => None,
        }
    }

    /// Whether the named backend is compiled in.
    pub fn adapter_available(name: &str) -> bool {
        match Self::canonical_name(name) {
            Some("memory") => true,
            Some("redis") => cfg!(feature = "redis"),
            Some("database") => cfg!(feature = "postgres"),
            Some("dynamodb") => cfg!(feature = "dynamodb"),
            _ => false,
        }
    }

    /// Description of every known backend, keyed by name.
    pub fn adapter_info() -> BTreeMap<&'static str, AdapterInfo> {
        let entries = [
            AdapterInfo {
                name: "memory",
                description: "Process-local map; not shared between processes",
                feature: None,
                available: true,
                shared: false,
                native_ttl: false,
                supports_locking: true,
            },
            AdapterInfo {
                name: "redis",
                description: "Redis with native key expiry and SET NX locks",
                feature: Some("redis"),
                available: cfg!(feature = "redis"),
                shared: true,
                native_ttl: true,
                supports_locking: true,
            },
            AdapterInfo {
                name: "database",
                description: "PostgreSQL tables with explicit expiry and lock rows",
                feature: Some("postgres"),
                available: cfg!(feature = "postgres"),
                shared: true,
                native_ttl: false,
                supports_locking: true,
            },
            AdapterInfo {
                name: "dynamodb",
                description: "DynamoDB with native TTL and conditional-write locks",
                feature: Some("dynamodb"),
                available: cfg!(feature = "dynamodb"),
                shared: true,
                native_ttl: true,
                supports_locking: true,
            },
        ];

        entries.into_iter().map(|info| (info.name, info)).collect()
    }

    /// Validate storage settings without connecting.
    ///
    /// Order: adapter name, compiled-in feature, connection parameters,
    /// then encryption for shared backends.
    pub fn validate_config(config: &TokenCacheConfig) -> TokenCacheResult<&'static str> {
        let requested = config.storage.adapter.as_str();
        let name = Self::canonical_name(requested).ok_or_else(|| {
            TokenCacheError::Configuration(ConfigurationError::UnknownAdapter {
                name: requested.to_string(),
                expected: ADAPTER_NAMES.join(", "),
            })
        })?;

        if !Self::adapter_available(name) {
            let dependency = match name {
                "redis" => "redis",
                "database" => "postgres",
                _ => "dynamodb",
            };
            return Err(TokenCacheError::Configuration(
                ConfigurationError::DependencyUnavailable {
                    adapter: name.to_string(),
                    dependency: dependency.to_string(),
                },
            ));
        }

        match name {
            "redis" | "database" => {
                let has_url = config
                    .storage
                    .url
                    .as_deref()
                    .map(|u| !u.trim().is_empty())
                    .unwrap_or(false);
                if !has_url {
                    return Err(TokenCacheError::Configuration(
                        ConfigurationError::MissingConnectionUrl {
                            adapter: name.to_string(),
                        },
                    ));
                }
            }
            "dynamodb" => {
                let has_table = config
                    .storage
                    .table_name
                    .as_deref()
                    .map(|t| !t.trim().is_empty())
                    .unwrap_or(false);
                if !has_table {
                    return Err(TokenCacheError::Configuration(
                        ConfigurationError::MissingTableName {
                            adapter: name.to_string(),
                        },
                    ));
                }
            }
            _ => {}
        }

        if name != "memory" {
            let key = config.active_encryption_key().ok_or_else(|| {
                TokenCacheError::Configuration(ConfigurationError::EncryptionKeyRequired {
                    adapter: name.to_string(),
                })
            })?;
            encryption::validate_key(key.expose_secret())?;
        } else if let Some(key) = config.active_encryption_key() {
            encryption::validate_key(key.expose_secret())?;
        }

        Ok(name)
    }

    /// Validate the configuration and build the selected backend.
    pub async fn create(config: &TokenCacheConfig) -> TokenCacheResult<Arc<dyn StorageAdapter>> {
        let name = Self::validate_config(config)?;
        let codec = RecordCodec::from_config(config);

        let adapter: Arc<dyn StorageAdapter> = match name {
            "memory" => Arc::new(MemoryStorageAdapter::from_config(config)),
            #[cfg(feature = "redis")]
            "redis" => Arc::new(Self::create_redis(config, codec)?),
            #[cfg(feature = "postgres")]
            "database" => Arc::new(Self::create_postgres(config, codec).await?),
            #[cfg(feature = "dynamodb")]
            "dynamodb" => Arc::new(Self::create_dynamodb(config, codec).await?),
            other => {
                let _ = codec;
                return Err(TokenCacheError::Configuration(
                    ConfigurationError::DependencyUnavailable {
                        adapter: other.to_string(),
                        dependency: other.to_string(),
                    },
                ));
            }
        };

        info!(
            adapter = adapter.name(),
            encrypted = config.active_encryption_key().is_some(),
            "token storage ready"
        );
        Ok(adapter)
    }

    #[cfg(feature = "redis")]
    fn create_redis(
        config: &TokenCacheConfig,
        codec: RecordCodec,
    ) -> TokenCacheResult<super::RedisStorageAdapter> {
        let url = connection_url(config, "redis")?;
        super::RedisStorageAdapter::connect(url, config.storage.pool_size, codec)
    }

    #[cfg(feature = "postgres")]
    async fn create_postgres(
        config: &TokenCacheConfig,
        codec: RecordCodec,
    ) -> TokenCacheResult<super::PostgresStorageAdapter> {
        let url = connection_url(config, "database")?;
        super::PostgresStorageAdapter::connect(
            url,
            config.storage.pool_size,
            config.storage.table_name.as_deref(),
            config.storage.lock_table_name.as_deref(),
            config.storage.auto_migrate,
            codec,
        )
        .await
    }

    #[cfg(feature = "dynamodb")]
    async fn create_dynamodb(
        config: &TokenCacheConfig,
        codec: RecordCodec,
    ) -> TokenCacheResult<super::DynamoDbStorageAdapter> {
        use super::dynamodb::signing::AwsCredentials;
        use super::dynamodb::DynamoDbSettings;

        let settings = DynamoDbSettings::from_storage_config(&config.storage)?;
        let credentials = AwsCredentials::from_storage_config(&config.storage)?;
        let transport = Arc::new(crate::core::create_transport(
            config.timeout,
            config.connect_timeout,
        )?);

        super::DynamoDbStorageAdapter::connect(settings, credentials, transport, codec).await
    }
}

#[cfg(any(feature = "redis", feature = "postgres"))]
fn connection_url<'a>(config: &'a TokenCacheConfig, adapter: &str) -> TokenCacheResult<&'a str> {
    config.storage.url.as_deref().ok_or_else(|| {
        TokenCacheError::Configuration(ConfigurationError::MissingConnectionUrl {
            adapter: adapter.to_string(),
        })
    })
}
