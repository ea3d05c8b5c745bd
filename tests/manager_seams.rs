//! Token manager behaviour at the flow and storage seams.

use async_trait::async_trait;
use mockall::mock;
use mockall::predicate::always;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oauth2_token_cache::{
    token_cache_config, ClientCredentialsFlow, ClientCredentialsRequest, DefaultTokenManager,
    LockRecord, ServerError, StorageAdapter, TokenCacheConfig, TokenCacheError, TokenCacheResult,
    TokenManager, TokenRecord, TokenResponse,
};

mock! {
    pub Flow {}

    #[async_trait]
    impl ClientCredentialsFlow for Flow {
        async fn request_token(
            &self,
            request: ClientCredentialsRequest,
        ) -> Result<TokenResponse, TokenCacheError>;
    }
}

mock! {
    pub Storage {}

    #[async_trait]
    impl StorageAdapter for Storage {
        fn name(&self) -> &'static str;
        async fn store(&self, key: &str, record: &TokenRecord, ttl_seconds: i64) -> TokenCacheResult<bool>;
        async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>>;
        async fn exists(&self, key: &str) -> TokenCacheResult<bool>;
        async fn delete(&self, key: &str) -> TokenCacheResult<bool>;
        async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64>;
        async fn healthy(&self) -> bool;
        fn supports_locking(&self) -> bool;
        async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>>;
        async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool>;
        async fn cleanup_expired(&self) -> TokenCacheResult<u64>;
    }
}

fn config() -> TokenCacheConfig {
    token_cache_config()
        .client_id("svc-inventory")
        .client_secret("secret")
        .token_endpoint("https://auth.example.com/oauth/token")
        .environment("test")
        .build()
        .unwrap()
}

fn token_response(token: &str) -> TokenResponse {
    TokenResponse {
        access_token: token.to_string(),
        token_type: "Bearer".to_string(),
        expires_in: Some(3600),
        scope: None,
        extra: HashMap::new(),
    }
}

#[tokio::test]
async fn test_unauthorized_is_surfaced_after_one_attempt() {
    let mut flow = MockFlow::new();
    flow.expect_request_token()
        .times(1)
        .returning(|_| Err(TokenCacheError::unauthorized("invalid_client")));

    let mut storage = MockStorage::new();
    storage.expect_retrieve().returning(|_| Ok(None));
    storage.expect_supports_locking().return_const(false);
    storage.expect_store().never();

    let manager = DefaultTokenManager::new(&config(), Arc::new(flow), Arc::new(storage));
    assert!(matches!(
        manager.token(None).await,
        Err(TokenCacheError::Unauthorized { .. })
    ));
}

#[tokio::test]
async fn test_store_failure_still_returns_fresh_token() {
    let mut flow = MockFlow::new();
    flow.expect_request_token()
        .times(1)
        .returning(|_| Ok(token_response("fresh")));

    let mut storage = MockStorage::new();
    storage.expect_retrieve().returning(|_| Ok(None));
    storage.expect_supports_locking().return_const(false);
    storage
        .expect_store()
        .times(1)
        .returning(|_, _, _| Err(TokenCacheError::backend("redis", "connection reset")));

    let manager = DefaultTokenManager::new(&config(), Arc::new(flow), Arc::new(storage));
    assert_eq!(manager.token(None).await.unwrap(), "fresh");
}

#[tokio::test]
async fn test_read_failure_propagates_without_refresh() {
    let mut flow = MockFlow::new();
    flow.expect_request_token().never();

    let mut storage = MockStorage::new();
    storage
        .expect_retrieve()
        .returning(|_| Err(TokenCacheError::backend("database", "pool timed out")));

    let manager = DefaultTokenManager::new(&config(), Arc::new(flow), Arc::new(storage));
    assert!(matches!(
        manager.token(None).await,
        Err(TokenCacheError::Server(ServerError::Backend { backend: "database", .. }))
    ));
}

#[tokio::test]
async fn test_lock_is_released_when_refresh_fails() {
    let mut flow = MockFlow::new();
    flow.expect_request_token()
        .times(1)
        .returning(|_| Err(TokenCacheError::unauthorized("invalid_client")));

    let mut storage = MockStorage::new();
    storage.expect_retrieve().returning(|_| Ok(None));
    storage.expect_supports_locking().return_const(true);
    storage
        .expect_acquire_lock()
        .withf(|key, _| key.ends_with(":lock"))
        .times(1)
        .returning(|key, ttl| Ok(Some(LockRecord::new(key, ttl))));
    storage
        .expect_release_lock()
        .with(always())
        .times(1)
        .returning(|_| Ok(true));

    let manager = DefaultTokenManager::new(&config(), Arc::new(flow), Arc::new(storage));
    assert!(manager.token(None).await.is_err());
}

#[tokio::test]
async fn test_scope_sent_only_when_not_default() {
    let mut flow = MockFlow::new();
    flow.expect_request_token()
        .withf(|request| request.scope.as_deref() == Some("read_stock write_stock"))
        .times(1)
        .returning(|_| Ok(token_response("scoped")));

    let mut storage = MockStorage::new();
    storage.expect_retrieve().returning(|_| Ok(None));
    storage.expect_supports_locking().return_const(false);
    storage
        .expect_store()
        .withf(|key, record, ttl| {
            key.starts_with("oauth2_token:scopes:test:svc-inventory:")
                && record.scope == "api_access"
                && *ttl > 3000
        })
        .times(1)
        .returning(|_, _, _| Ok(true));

    let manager = DefaultTokenManager::new(&config(), Arc::new(flow), Arc::new(storage));
    let token = manager.token(Some("write_stock read_stock")).await.unwrap();
    assert_eq!(token, "scoped");
}
