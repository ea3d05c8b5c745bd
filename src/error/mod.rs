//! Token Cache Error Types
//!
//! Error taxonomy shared by the token manager, the storage adapters and the
//! token endpoint flow. Backend-native errors never cross the adapter boundary.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Root error type for token cache operations.
#[derive(Error, Debug)]
pub enum TokenCacheError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Rate limited by token endpoint")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

impl TokenCacheError {
    /// Stable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "TOKEN_CACHE_CONFIG",
            Self::Unauthorized { .. } => "TOKEN_CACHE_UNAUTHORIZED",
            Self::Forbidden { .. } => "TOKEN_CACHE_FORBIDDEN",
            Self::RateLimited { .. } => "TOKEN_CACHE_RATE_LIMITED",
            Self::Server(_) => "TOKEN_CACHE_SERVER",
        }
    }

    /// Check if the caller may retry the operation later.
    ///
    /// The token manager itself never retries; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Server(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get retry-after duration if the token endpoint provided one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Shorthand for an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Shorthand for a backend failure.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Server(ServerError::Backend {
            backend,
            message: message.into(),
        })
    }

    /// Shorthand for an invalid configuration.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::InvalidConfig {
            message: message.into(),
        })
    }
}

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },

    #[error("Unknown storage adapter '{name}' (expected one of: {expected})")]
    UnknownAdapter { name: String, expected: String },

    #[error("Storage adapter '{adapter}' requires the '{dependency}' feature, which is not enabled")]
    DependencyUnavailable {
        adapter: String,
        dependency: String,
    },

    #[error("Storage adapter '{adapter}' requires a connection URL (storage.url)")]
    MissingConnectionUrl { adapter: String },

    #[error("Storage adapter '{adapter}' requires a table name (storage.table_name)")]
    MissingTableName { adapter: String },

    #[error("Storage adapter '{adapter}' is shared across processes and requires an encryption key")]
    EncryptionKeyRequired { adapter: String },

    #[error("Invalid encryption key: {reason}")]
    InvalidEncryptionKey { reason: String },

    #[error("Malformed encrypted envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Unsupported envelope version {version} / algorithm '{algorithm}'")]
    UnsupportedEnvelope { version: u32, algorithm: String },

    #[error("Scopes not permitted by allowlist: {scopes}")]
    ScopeNotAllowed { scopes: String },

    #[error("Storage schema invalid: {message}")]
    InvalidSchema { message: String },
}

/// Server-side, transport and backend failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Token endpoint returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid token endpoint response: {message}")]
    InvalidResponse { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("Could not acquire lock '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },
}

impl ServerError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => *status >= 500,
            Self::InvalidResponse { .. } => false,
            _ => true,
        }
    }
}

/// Result type for token cache operations.
pub type TokenCacheResult<T> = Result<T, TokenCacheError>;

/// OAuth2 error response from the token endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

impl OAuth2ErrorResponse {
    fn message(&self) -> String {
        match &self.error_description {
            Some(description) => format!("{}: {}", self.error, description),
            None => self.error.clone(),
        }
    }
}

/// Parse error response from HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Create error from a non-success token endpoint response.
///
/// Status takes precedence; the RFC 6749 `error` field only refines 4xx
/// responses that are not 401/403/429.
pub fn create_error_from_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> TokenCacheError {
    let parsed = parse_error_response(body);
    let message = parsed
        .as_ref()
        .map(OAuth2ErrorResponse::message)
        .unwrap_or_else(|| format!("HTTP {}", status));

    match status {
        401 => TokenCacheError::Unauthorized { message },
        403 => TokenCacheError::Forbidden { message },
        429 => TokenCacheError::RateLimited {
            retry_after: headers
                .get("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        500..=599 => TokenCacheError::Server(ServerError::Upstream { status, message }),
        _ => match parsed.as_ref().map(|r| r.error.as_str()) {
            Some("invalid_client") => TokenCacheError::Unauthorized { message },
            Some("unauthorized_client") | Some("access_denied") | Some("invalid_scope") => {
                TokenCacheError::Forbidden { message }
            }
            _ => TokenCacheError::Server(ServerError::Upstream { status, message }),
        },
    }
}
