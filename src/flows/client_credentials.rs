//! Client Credentials Flow
//!
//! RFC 6749 Section 4.4 - Client Credentials Grant.

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{HttpRequest, HttpTransport};
use crate::error::{create_error_from_response, ServerError, TokenCacheError};
use crate::types::{TokenCacheConfig, TokenResponse};

/// Client Credentials Flow request parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentialsRequest {
    /// Normalized scope to request; `None` leaves the scope to the server.
    pub scope: Option<String>,
}

/// Client Credentials Flow interface.
#[async_trait]
pub trait ClientCredentialsFlow: Send + Sync {
    /// Request access token using client credentials.
    async fn request_token(
        &self,
        request: ClientCredentialsRequest,
    ) -> Result<TokenResponse, TokenCacheError>;
}

/// Client Credentials Flow implementation.
pub struct ClientCredentialsFlowImpl<T: HttpTransport> {
    client_id: String,
    client_secret: SecretString,
    token_endpoint: String,
    timeout: Duration,
    transport: Arc<T>,
}

impl<T: HttpTransport> ClientCredentialsFlowImpl<T> {
    /// Create new Client Credentials Flow.
    pub fn new(config: &TokenCacheConfig, transport: Arc<T>) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_endpoint: config.token_endpoint.clone(),
            timeout: config.timeout,
            transport,
        }
    }

    fn build_request_body(&self, request: &ClientCredentialsRequest) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", self.client_secret.expose_secret());

        if let Some(scope) = request.scope.as_deref().filter(|s| !s.is_empty()) {
            form.append_pair("scope", scope);
        }

        form.finish()
    }
}

#[async_trait]
impl<T: HttpTransport> ClientCredentialsFlow for ClientCredentialsFlowImpl<T> {
    async fn request_token(
        &self,
        request: ClientCredentialsRequest,
    ) -> Result<TokenResponse, TokenCacheError> {
        let http_request =
            HttpRequest::post(&self.token_endpoint, self.build_request_body(&request))
                .header("content-type", "application/x-www-form-urlencoded")
                .header("accept", "application/json")
                .timeout(self.timeout);

        let response = self.transport.send(http_request).await?;

        if !response.is_success() {
            return Err(create_error_from_response(
                response.status,
                &response.headers,
                &response.body,
            ));
        }

        let token_response: TokenResponse = serde_json::from_str(&response.body).map_err(|e| {
            TokenCacheError::Server(ServerError::InvalidResponse {
                message: format!("invalid token response: {}", e),
            })
        })?;

        if token_response.access_token.is_empty() {
            return Err(TokenCacheError::Server(ServerError::InvalidResponse {
                message: "token response carries an empty access_token".to_string(),
            }));
        }

        Ok(token_response)
    }
}

/// Mock Client Credentials Flow for testing.
///
/// Queued outcomes are served in order; once the queue is empty every call
/// returns a fresh token `mock-token-<n>`.
#[derive(Default)]
pub struct MockClientCredentialsFlow {
    request_history: Mutex<Vec<ClientCredentialsRequest>>,
    outcomes: Mutex<VecDeque<Result<TokenResponse, TokenCacheError>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockClientCredentialsFlow {
    /// Create new mock flow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a token response.
    pub fn queue_token_response(&self, response: TokenResponse) -> &Self {
        self.outcomes.lock().push_back(Ok(response));
        self
    }

    /// Queue an error.
    pub fn queue_error(&self, error: TokenCacheError) -> &Self {
        self.outcomes.lock().push_back(Err(error));
        self
    }

    /// Simulate upstream latency on every call.
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Number of upstream calls made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Get request history.
    pub fn get_request_history(&self) -> Vec<ClientCredentialsRequest> {
        self.request_history.lock().clone()
    }
}

#[async_trait]
impl ClientCredentialsFlow for MockClientCredentialsFlow {
    async fn request_token(
        &self,
        request: ClientCredentialsRequest,
    ) -> Result<TokenResponse, TokenCacheError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.request_history.lock().push(request.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(outcome) = self.outcomes.lock().pop_front() {
            return outcome;
        }

        Ok(TokenResponse {
            access_token: format!("mock-token-{}", call),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            scope: request.scope,
            extra: HashMap::new(),
        })
    }
}

/// Create mock Client Credentials Flow for testing.
pub fn create_mock_client_credentials_flow() -> MockClientCredentialsFlow {
    MockClientCredentialsFlow::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HttpResponse, MockHttpTransport};

    fn config() -> TokenCacheConfig {
        crate::builders::token_cache_config()
            .client_id("client-1")
            .client_secret("s3cr3t&=")
            .token_endpoint("https://auth.example.com/oauth2/token")
            .build()
            .unwrap()
    }

    fn form(body: &str) -> HashMap<String, String> {
        url::form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect()
    }

    #[tokio::test]
    async fn test_request_token_sends_form() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(
            200,
            &serde_json::json!({
                "access_token": "abc",
                "token_type": "Bearer",
                "expires_in": 1800,
                "scope": "payments_read"
            }),
        );

        let flow = ClientCredentialsFlowImpl::new(&config(), transport.clone());
        let response = flow
            .request_token(ClientCredentialsRequest {
                scope: Some("payments_read".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(response.access_token, "abc");
        assert_eq!(response.expires_in, Some(1800));

        let sent = transport.get_last_request().unwrap();
        assert_eq!(sent.url, "https://auth.example.com/oauth2/token");
        assert_eq!(
            sent.headers["content-type"],
            "application/x-www-form-urlencoded"
        );
        assert_eq!(sent.headers["accept"], "application/json");

        let params = form(sent.body.as_deref().unwrap());
        assert_eq!(params["grant_type"], "client_credentials");
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["client_secret"], "s3cr3t&=");
        assert_eq!(params["scope"], "payments_read");
    }

    #[tokio::test]
    async fn test_scope_omitted_when_absent() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(200, &serde_json::json!({"access_token": "abc"}));

        let flow = ClientCredentialsFlowImpl::new(&config(), transport.clone());
        flow.request_token(ClientCredentialsRequest::default())
            .await
            .unwrap();

        let sent = transport.get_last_request().unwrap();
        assert!(!form(sent.body.as_deref().unwrap()).contains_key("scope"));
    }

    #[tokio::test]
    async fn test_absurd_expires_in_builds_capped_record() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: r#"{"access_token":"t","expires_in":100000000000000000}"#.to_string(),
        });

        let flow = ClientCredentialsFlowImpl::new(&config(), transport);
        let response = flow
            .request_token(ClientCredentialsRequest::default())
            .await
            .unwrap();
        assert_eq!(response.expires_in, Some(100_000_000_000_000_000));

        let record = crate::types::TokenRecord::from_response(
            &response,
            "client-1",
            "api_access".to_string(),
            Duration::from_secs(10),
        );
        assert!(record.is_valid());
        assert!(record.ttl_seconds() <= crate::types::MAX_EXPIRES_IN_SECS as i64);
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_taxonomy() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_json_response(401, &serde_json::json!({"error": "invalid_client"}));
        transport.queue_json_response(403, &serde_json::json!({"error": "access_denied"}));
        transport.queue_response(HttpResponse {
            status: 429,
            headers: [("retry-after".to_string(), "7".to_string())]
                .into_iter()
                .collect(),
            body: String::new(),
        });
        transport.queue_json_response(503, &serde_json::json!({"error": "unavailable"}));

        let flow = ClientCredentialsFlowImpl::new(&config(), transport.clone());
        let request = ClientCredentialsRequest::default;

        assert!(matches!(
            flow.request_token(request()).await,
            Err(TokenCacheError::Unauthorized { .. })
        ));
        assert!(matches!(
            flow.request_token(request()).await,
            Err(TokenCacheError::Forbidden { .. })
        ));
        match flow.request_token(request()).await {
            Err(TokenCacheError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(matches!(
            flow.request_token(request()).await,
            Err(TokenCacheError::Server(ServerError::Upstream { status: 503, .. }))
        ));
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn test_invalid_body_is_server_error() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.queue_response(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: "<html>".to_string(),
        });

        let flow = ClientCredentialsFlowImpl::new(&config(), transport);
        assert!(matches!(
            flow.request_token(ClientCredentialsRequest::default()).await,
            Err(TokenCacheError::Server(ServerError::InvalidResponse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_mock_flow_counts_calls() {
        let flow = MockClientCredentialsFlow::new();
        flow.queue_error(TokenCacheError::unauthorized("bad credentials"));

        assert!(flow
            .request_token(ClientCredentialsRequest::default())
            .await
            .is_err());

        let response = flow
            .request_token(ClientCredentialsRequest {
                scope: Some("a_1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(response.access_token, "mock-token-2");
        assert_eq!(response.scope.as_deref(), Some("a_1"));
        assert_eq!(flow.call_count(), 2);
        assert_eq!(flow.get_request_history().len(), 2);
    }
}
