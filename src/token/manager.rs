//! Token Manager
//!
//! Hands out cached client-credentials tokens and refreshes them with
//! double-checked locking: a cache read, then a per-key in-process gate,
//! then the backend's distributed lock, re-reading the cache at each level
//! so that one caller refreshes while the rest reuse its result.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{create_transport, ReqwestHttpTransport, ScopeManager};
use crate::error::{ConfigurationError, TokenCacheError, TokenCacheResult};
use crate::flows::{ClientCredentialsFlow, ClientCredentialsFlowImpl, ClientCredentialsRequest};
use crate::storage::{lock_key, with_lock, AdapterFactory, LockPolicy, StorageAdapter};
use crate::types::{TokenCacheConfig, TokenRecord};

/// Token manager interface.
///
/// `scopes` is a space-delimited scope string; `None` or blank selects the
/// default scope.
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Get a valid access token, refreshing if necessary.
    async fn token(&self, scopes: Option<&str>) -> TokenCacheResult<String>;

    /// Get the full cached record, refreshing if necessary.
    async fn token_record(&self, scopes: Option<&str>) -> TokenCacheResult<TokenRecord>;

    /// Drop the cached token for a scope set.
    async fn invalidate(&self, scopes: Option<&str>) -> TokenCacheResult<bool>;

    /// Drop every cached token of this client and environment.
    async fn clear_cache(&self) -> TokenCacheResult<u64>;

    /// Sweep expired records from backends without native expiry.
    async fn cleanup_expired(&self) -> TokenCacheResult<u64>;

    /// Check that the storage backend is reachable.
    async fn healthy(&self) -> bool;
}

/// Default token manager implementation.
pub struct DefaultTokenManager<F: ClientCredentialsFlow> {
    client_id: String,
    allowed_scopes: Option<Vec<String>>,
    safety_buffer: Duration,
    lock_policy: LockPolicy,
    scopes: ScopeManager,
    flow: Arc<F>,
    storage: Arc<dyn StorageAdapter>,
    refresh_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<F: ClientCredentialsFlow> DefaultTokenManager<F> {
    /// Create new token manager.
    pub fn new(config: &TokenCacheConfig, flow: Arc<F>, storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            client_id: config.client_id.clone(),
            allowed_scopes: config.allowed_scopes.clone(),
            safety_buffer: config.cache.safety_buffer,
            lock_policy: LockPolicy::from_cache_config(&config.cache),
            scopes: ScopeManager::from_config(config),
            flow,
            storage,
            refresh_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Storage backend in use.
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Scope manager in use.
    pub fn scope_manager(&self) -> &ScopeManager {
        &self.scopes
    }

    /// Cache key for a scope string.
    pub fn cache_key(&self, scopes: Option<&str>) -> String {
        let normalized = self.scopes.normalize(scopes);
        self.scopes.cache_key(&self.client_id, &normalized)
    }

    /// Get a token for a list of scopes.
    pub async fn token_for_scopes<I, S>(&self, scopes: I) -> TokenCacheResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = self.scopes.normalize(scopes);
        Ok(self.record_for(&normalized).await?.access_token)
    }

    async fn record_for(&self, normalized: &str) -> TokenCacheResult<TokenRecord> {
        if !ScopeManager::allowed(normalized, self.allowed_scopes.as_deref()) {
            let rejected: Vec<&str> = normalized
                .split_whitespace()
                .filter(|s| !ScopeManager::allowed(s, self.allowed_scopes.as_deref()))
                .collect();
            return Err(TokenCacheError::Configuration(
                ConfigurationError::ScopeNotAllowed {
                    scopes: rejected.join(" "),
                },
            ));
        }

        let invalid = ScopeManager::invalid_scopes(normalized);
        if !invalid.is_empty() {
            debug!(scopes = ?invalid, "requested scopes do not follow the segment_segment shape");
        }

        let key = self.scopes.cache_key(&self.client_id, normalized);

        if let Some(record) = self.cached(&key).await? {
            debug!(key = %key, "token cache hit");
            return Ok(record);
        }

        let gate = self.refresh_gate(&key);
        let result = self.refresh_under_gate(&key, normalized, &gate).await;
        self.prune_gate(&key, gate);
        result
    }

    async fn refresh_under_gate(
        &self,
        key: &str,
        normalized: &str,
        gate: &tokio::sync::Mutex<()>,
    ) -> TokenCacheResult<TokenRecord> {
        let _guard = gate.lock().await;

        if let Some(record) = self.cached(key).await? {
            debug!(key = %key, "token refreshed by another task");
            return Ok(record);
        }

        with_lock(&self.storage, &lock_key(key), &self.lock_policy, || async move {
            if let Some(record) = self.cached(key).await? {
                debug!(key = %key, "token refreshed by another process");
                return Ok(record);
            }
            self.refresh(key, normalized).await
        })
        .await
    }

    fn refresh_gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_gates
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Drops the gate entry once no other caller holds or awaits it.
    fn prune_gate(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.refresh_gates.lock();
        drop(gate);
        if gates.get(key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            gates.remove(key);
        }
    }

    async fn cached(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>> {
        let record = self.storage.retrieve(key).await?;
        Ok(record.filter(|r| r.is_valid() && r.client_id == self.client_id))
    }

    async fn refresh(&self, key: &str, normalized: &str) -> TokenCacheResult<TokenRecord> {
        let request = ClientCredentialsRequest {
            scope: (normalized != self.scopes.default_scope()).then(|| normalized.to_string()),
        };

        info!(client_id = %self.client_id, scope = %normalized, "requesting access token");
        let response = self.flow.request_token(request).await?;

        let granted = match response.scope.as_deref() {
            Some(scope) if !scope.trim().is_empty() => self.scopes.normalize([scope]),
            _ => self.scopes.default_scope().to_string(),
        };
        if !ScopeManager::compatible(&granted, normalized) {
            warn!(requested = %normalized, granted = %granted, "token granted fewer scopes than requested");
        }

        let record = TokenRecord::from_response(
            &response,
            &self.client_id,
            granted,
            self.safety_buffer,
        );

        let ttl = record.ttl_seconds();
        if ttl <= 0 {
            warn!(
                key = %key,
                expires_in = ?response.expires_in,
                safety_buffer_secs = self.safety_buffer.as_secs(),
                "token lifetime is within the safety buffer; returning it uncached"
            );
            return Ok(record);
        }

        match self.storage.store(key, &record, ttl).await {
            Ok(_) => debug!(key = %key, ttl_seconds = ttl, "cached access token"),
            Err(e) => warn!(
                key = %key,
                error = %e,
                "failed to cache access token; returning it uncached"
            ),
        }

        Ok(record)
    }
}

#[async_trait]
impl<F: ClientCredentialsFlow> TokenManager for DefaultTokenManager<F> {
    async fn token(&self, scopes: Option<&str>) -> TokenCacheResult<String> {
        Ok(self.token_record(scopes).await?.access_token)
    }

    async fn token_record(&self, scopes: Option<&str>) -> TokenCacheResult<TokenRecord> {
        let normalized = self.scopes.normalize(scopes);
        self.record_for(&normalized).await
    }

    async fn invalidate(&self, scopes: Option<&str>) -> TokenCacheResult<bool> {
        let key = self.cache_key(scopes);
        let removed = self.storage.delete(&key).await?;
        debug!(key = %key, removed, "invalidated cached token");
        Ok(removed)
    }

    async fn clear_cache(&self) -> TokenCacheResult<u64> {
        let prefix = self.scopes.client_prefix(&self.client_id);
        let removed = self.storage.clear_all(&prefix).await?;
        info!(client_id = %self.client_id, removed, "cleared token cache");
        Ok(removed)
    }

    async fn cleanup_expired(&self) -> TokenCacheResult<u64> {
        self.storage.cleanup_expired().await
    }

    async fn healthy(&self) -> bool {
        self.storage.healthy().await
    }
}

/// Production token manager type.
pub type ReqwestTokenManager = DefaultTokenManager<ClientCredentialsFlowImpl<ReqwestHttpTransport>>;

/// Build a token manager with the configured storage backend and the
/// reqwest transport.
pub async fn create_token_manager(config: &TokenCacheConfig) -> TokenCacheResult<ReqwestTokenManager> {
    let storage = AdapterFactory::create(config).await?;
    let transport = Arc::new(create_transport(config.timeout, config.connect_timeout)?);
    let flow = Arc::new(ClientCredentialsFlowImpl::new(config, transport));
    Ok(DefaultTokenManager::new(config, flow, storage))
}

/// Mock token manager for testing.
#[derive(Default)]
pub struct MockTokenManager {
    tokens: Mutex<HashMap<String, String>>,
    request_history: Mutex<Vec<Option<String>>>,
    next_error: Mutex<Option<TokenCacheError>>,
}

impl MockTokenManager {
    /// Create new mock token manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the token returned for a scope string.
    pub fn add_token(&self, scopes: &str, token: impl Into<String>) -> &Self {
        self.tokens.lock().insert(scopes.to_string(), token.into());
        self
    }

    /// Fail the next call.
    pub fn set_next_error(&self, error: TokenCacheError) -> &Self {
        *self.next_error.lock() = Some(error);
        self
    }

    /// Scopes requested so far.
    pub fn get_request_history(&self) -> Vec<Option<String>> {
        self.request_history.lock().clone()
    }

    fn check_error(&self) -> TokenCacheResult<()> {
        match self.next_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TokenManager for MockTokenManager {
    async fn token(&self, scopes: Option<&str>) -> TokenCacheResult<String> {
        Ok(self.token_record(scopes).await?.access_token)
    }

    async fn token_record(&self, scopes: Option<&str>) -> TokenCacheResult<TokenRecord> {
        self.check_error()?;
        self.request_history.lock().push(scopes.map(String::from));

        let scope = scopes.unwrap_or_default().to_string();
        let access_token = self
            .tokens
            .lock()
            .get(&scope)
            .cloned()
            .unwrap_or_else(|| format!("mock-token-for-{}", scope));

        let now = chrono::Utc::now();
        Ok(TokenRecord {
            access_token,
            scope,
            expires_at: now + chrono::Duration::seconds(3600),
            client_id: "mock-client".to_string(),
            created_at: now,
        })
    }

    async fn invalidate(&self, scopes: Option<&str>) -> TokenCacheResult<bool> {
        self.check_error()?;
        Ok(self
            .tokens
            .lock()
            .remove(scopes.unwrap_or_default())
            .is_some())
    }

    async fn clear_cache(&self) -> TokenCacheResult<u64> {
        self.check_error()?;
        let mut tokens = self.tokens.lock();
        let removed = tokens.len() as u64;
        tokens.clear();
        Ok(removed)
    }

    async fn cleanup_expired(&self) -> TokenCacheResult<u64> {
        self.check_error()?;
        Ok(0)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

/// Create mock token manager for testing.
pub fn create_mock_token_manager() -> MockTokenManager {
    MockTokenManager::new()
}
