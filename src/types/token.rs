//! Token Types
//!
//! Token endpoint responses and the records persisted in the cache.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `expires_in` assumed when the token endpoint omits it.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 300;

/// Longest lifetime accepted from the token endpoint (one year).
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Token response from the authorization server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// Additional fields.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    /// Lifetime reported by the server, or the default when absent,
    /// capped at [`MAX_EXPIRES_IN_SECS`].
    pub fn lifetime_secs(&self) -> u64 {
        self.expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .min(MAX_EXPIRES_IN_SECS)
    }
}

/// Cached token. Replaced wholesale on refresh, never edited in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Bearer token handed to callers.
    pub access_token: String,
    /// Normalized, space-joined scope set.
    pub scope: String,
    /// Instant after which the record must not be handed out.
    /// Already reduced by the safety buffer.
    pub expires_at: DateTime<Utc>,
    /// Client the token was issued to.
    pub client_id: String,
    /// When the token was obtained.
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Build a record from a token response.
    ///
    /// `expires_at = now + expires_in - safety_buffer`.
    pub fn from_response(
        response: &TokenResponse,
        client_id: &str,
        scope: String,
        safety_buffer: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        let expires_at = Duration::try_seconds(response.lifetime_secs() as i64)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .zip(Duration::from_std(safety_buffer).ok())
            .and_then(|(end, buffer)| end.checked_sub_signed(buffer))
            .unwrap_or(now);

        Self {
            access_token: response.access_token.clone(),
            scope,
            expires_at,
            client_id: client_id.to_string(),
            created_at: now,
        }
    }

    /// Check whether the record may still be handed out.
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// Remaining lifetime in whole seconds; zero or negative once expired.
    pub fn ttl_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

/// Distributed lock held for the duration of a refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    /// Backend key of the lock.
    pub lock_key: String,
    /// Random owner token; proves the right to release.
    pub owner: String,
    /// When the lock lapses if never released.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Create a lock record with a fresh random owner.
    pub fn new(lock_key: impl Into<String>, ttl: std::time::Duration) -> Self {
        use rand::RngCore;

        let mut owner = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut owner);

        Self {
            lock_key: lock_key.into(),
            owner: hex::encode(owner),
            expires_at: after(Utc::now(), ttl),
        }
    }

    /// Check if the lock has lapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// `start + duration`, saturating at the latest representable instant.
pub(crate) fn after(start: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(duration)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(expires_in: Option<u64>) -> TokenResponse {
        TokenResponse {
            access_token: "test-token".to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            scope: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "payments_read payments_write"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "test-token");
        assert_eq!(response.expires_in, Some(3600));
        assert_eq!(response.scope.as_deref(), Some("payments_read payments_write"));
    }

    #[test]
    fn test_missing_expires_in_defaults() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":"t"}"#).unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.lifetime_secs(), DEFAULT_EXPIRES_IN_SECS);
    }

    #[test]
    fn test_record_subtracts_safety_buffer() {
        let record = TokenRecord::from_response(
            &response(Some(3600)),
            "client",
            "api_read".to_string(),
            std::time::Duration::from_secs(10),
        );

        let ttl = record.ttl_seconds();
        assert!((3588..=3590).contains(&ttl), "ttl was {ttl}");
        assert!(record.is_valid());
    }

    #[test]
    fn test_record_inside_buffer_is_invalid() {
        let record = TokenRecord::from_response(
            &response(Some(5)),
            "client",
            "api_read".to_string(),
            std::time::Duration::from_secs(10),
        );

        assert!(!record.is_valid());
        assert!(record.ttl_seconds() <= 0);
    }

    #[test]
    fn test_huge_expires_in_is_capped() {
        let record = TokenRecord::from_response(
            &response(Some(u64::MAX)),
            "client",
            "api_read".to_string(),
            std::time::Duration::from_secs(10),
        );

        assert!(record.is_valid());
        assert!(record.ttl_seconds() <= MAX_EXPIRES_IN_SECS as i64);
        assert!(record.ttl_seconds() > MAX_EXPIRES_IN_SECS as i64 - 20);
    }

    #[test]
    fn test_huge_safety_buffer_expires_immediately() {
        let record = TokenRecord::from_response(
            &response(Some(3600)),
            "client",
            "api_read".to_string(),
            std::time::Duration::from_secs(u64::MAX),
        );
        assert!(!record.is_valid());
    }

    #[test]
    fn test_lock_with_huge_ttl_saturates() {
        let lock = LockRecord::new("k", std::time::Duration::MAX);
        assert!(!lock.is_expired());
    }

    #[test]
    fn test_lock_owners_are_unique() {
        let a = LockRecord::new("k", std::time::Duration::from_secs(5));
        let b = LockRecord::new("k", std::time::Duration::from_secs(5));
        assert_ne!(a.owner, b.owner);
        assert_eq!(a.owner.len(), 32);
        assert!(!a.is_expired());
    }
}
