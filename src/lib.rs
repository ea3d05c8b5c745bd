//! OAuth2 Token Cache
//!
//! Client-credentials access tokens cached in a pluggable, optionally
//! encrypted, shared store so that a fleet of processes refreshes each token
//! once instead of once per process.
//!
//! # Features
//!
//! - Client Credentials Flow (RFC 6749 Section 4.4)
//! - Scope normalization and scope-fingerprinted cache keys
//! - Storage backends: memory, Redis, PostgreSQL, DynamoDB
//! - Distributed refresh locks with bounded retry
//! - AES-256-GCM record encryption with PBKDF2-derived keys
//!
//! # Example
//!
//! ```rust,ignore
//! use oauth2_token_cache::{create_token_manager, token_cache_config, TokenManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = token_cache_config()
//!         .client_id("my-client-id")
//!         .client_secret("my-client-secret")
//!         .token_endpoint("https://provider.com/oauth/token")
//!         .storage_adapter("redis")
//!         .storage_url("redis://localhost:6379")
//!         .encryption_key(std::env::var("TOKEN_CACHE_ENCRYPTION_KEY")?)
//!         .build()?;
//!
//!     let manager = create_token_manager(&config).await?;
//!     let token = manager.token(Some("read_orders write_orders")).await?;
//!     println!("Bearer {}", token);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - `types`: configuration, token responses and cached records
//! - `error`: error hierarchy and token endpoint error mapping
//! - `core`: HTTP transport, scope handling, record encryption
//! - `flows`: client credentials grant
//! - `storage`: storage contract, backends, lock helpers, adapter factory
//! - `token`: token manager
//! - `builders`: fluent configuration builder

pub mod builders;
pub mod core;
pub mod error;
pub mod flows;
pub mod storage;
pub mod token;
pub mod types;

// Re-export builders
pub use builders::{token_cache_config, TokenCacheConfigBuilder};

// Re-export errors
pub use error::{
    create_error_from_response, parse_error_response, ConfigurationError, OAuth2ErrorResponse,
    ServerError, TokenCacheError, TokenCacheResult,
};

// Re-export types
pub use types::{
    // Config
    CacheConfig, EncryptionConfig, StorageConfig, TokenCacheConfig,
    // Token
    LockRecord, TokenRecord, TokenResponse,
};

// Re-export core components
pub use core::{
    // Transport
    create_mock_transport, create_transport, HttpMethod, HttpRequest, HttpResponse,
    HttpTransport, MockHttpTransport, ReqwestHttpTransport,
    // Scopes
    ScopeManager,
    // Encryption
    EncryptedEnvelope,
};

// Re-export flows
pub use flows::{
    ClientCredentialsFlow, ClientCredentialsFlowImpl, ClientCredentialsRequest,
    MockClientCredentialsFlow,
};

// Re-export storage
pub use storage::{
    acquire_lock_with_retry, lock_key, release_quietly, with_lock, AdapterFactory, AdapterInfo,
    LockGuard, LockPolicy, MemoryStorageAdapter, RecordCodec, StorageAdapter,
};

#[cfg(feature = "dynamodb")]
pub use storage::DynamoDbStorageAdapter;
#[cfg(feature = "postgres")]
pub use storage::PostgresStorageAdapter;
#[cfg(feature = "redis")]
pub use storage::RedisStorageAdapter;

// Re-export token management
pub use token::{
    create_mock_token_manager, create_token_manager, DefaultTokenManager, MockTokenManager,
    ReqwestTokenManager, TokenManager,
};
