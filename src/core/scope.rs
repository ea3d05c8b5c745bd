//! Scope Management
//!
//! Scope normalization, fingerprints and cache key derivation.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::types::TokenCacheConfig;

/// Separator between cache key segments.
pub const KEY_SEPARATOR: &str = ":";

/// Length of a scope fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// Normalizes scopes and derives cache keys for one client configuration.
#[derive(Clone, Debug)]
pub struct ScopeManager {
    default_scope: String,
    key_prefix: String,
    scope_prefix: String,
    environment: String,
}

impl ScopeManager {
    /// Create a scope manager.
    pub fn new(
        default_scope: impl Into<String>,
        key_prefix: impl Into<String>,
        scope_prefix: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        let default_scope = default_scope.into();
        Self {
            // The default goes through the same normalization as requests.
            default_scope: join_sorted(split_scopes([default_scope.as_str()])),
            key_prefix: key_prefix.into(),
            scope_prefix: scope_prefix.into(),
            environment: environment.into(),
        }
    }

    /// Create a scope manager from token cache configuration.
    pub fn from_config(config: &TokenCacheConfig) -> Self {
        Self::new(
            config.default_scope.clone(),
            config.cache.key_prefix.clone(),
            config.cache.scope_prefix.clone(),
            config.environment.clone(),
        )
    }

    /// Normalized default scope.
    pub fn default_scope(&self) -> &str {
        &self.default_scope
    }

    /// Normalize requested scopes.
    ///
    /// Accepts a single space-delimited string, a list of strings or an
    /// `Option<&str>`. Scopes are trimmed, deduplicated, sorted and joined
    /// with single spaces. Empty input yields the default scope.
    pub fn normalize<I, S>(&self, scopes: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = split_scopes(scopes);
        if set.is_empty() {
            return self.default_scope.clone();
        }
        join_sorted(set)
    }

    /// Deterministic 16 hex character digest of a normalized scope string.
    pub fn fingerprint(normalized: &str) -> String {
        let digest = Sha256::digest(normalized.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    /// Cache key: `prefix:scope_prefix:environment:client_id:fingerprint`.
    pub fn cache_key(&self, client_id: &str, normalized: &str) -> String {
        [
            self.key_prefix.as_str(),
            self.scope_prefix.as_str(),
            self.environment.as_str(),
            client_id,
            Self::fingerprint(normalized).as_str(),
        ]
        .join(KEY_SEPARATOR)
    }

    /// Prefix shared by every cache key of one client.
    pub fn client_prefix(&self, client_id: &str) -> String {
        let mut prefix = [
            self.key_prefix.as_str(),
            self.scope_prefix.as_str(),
            self.environment.as_str(),
            client_id,
        ]
        .join(KEY_SEPARATOR);
        prefix.push_str(KEY_SEPARATOR);
        prefix
    }

    /// True iff every requested scope is present in the cached scope set.
    pub fn compatible(cached: &str, requested: &str) -> bool {
        let cached: BTreeSet<&str> = cached.split_whitespace().collect();
        requested
            .split_whitespace()
            .all(|scope| cached.contains(scope))
    }

    /// True if there is no allowlist or every scope is on it.
    pub fn allowed(scopes: &str, allowlist: Option<&[String]>) -> bool {
        match allowlist {
            None => true,
            Some(list) => scopes
                .split_whitespace()
                .all(|scope| list.iter().any(|allowed| allowed == scope)),
        }
    }

    /// Advisory shape check: `segment_segment`, alphanumeric segments,
    /// exactly one separator.
    pub fn is_valid_scope(scope: &str) -> bool {
        let mut segments = scope.split('_');
        let valid_segment =
            |s: Option<&str>| matches!(s, Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()));

        valid_segment(segments.next()) && valid_segment(segments.next()) && segments.next().is_none()
    }

    /// Scopes that fail [`ScopeManager::is_valid_scope`]. Never raises.
    pub fn invalid_scopes(normalized: &str) -> Vec<String> {
        normalized
            .split_whitespace()
            .filter(|scope| !Self::is_valid_scope(scope))
            .map(String::from)
            .collect()
    }
}

fn split_scopes<I, S>(scopes: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    scopes
        .into_iter()
        .flat_map(|s| {
            s.as_ref()
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn join_sorted(set: BTreeSet<String>) -> String {
    set.into_iter().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ScopeManager {
        ScopeManager::new("api_access", "oauth2_token", "scopes", "sandbox")
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let scopes = manager();
        assert_eq!(
            scopes.normalize(["  payments_write payments_read ", "payments_read"]),
            "payments_read payments_write"
        );
        assert_eq!(
            scopes.normalize(Some("qr_create\tpayments_read")),
            "payments_read qr_create"
        );
    }

    #[test]
    fn test_normalize_is_idempotent_and_order_independent() {
        let scopes = manager();
        let inputs = [
            vec!["c_1", "a_1", "b_1"],
            vec!["b_1", "c_1", "a_1"],
            vec!["a_1 b_1", "c_1 a_1"],
        ];

        let first = scopes.normalize(&inputs[0]);
        for input in &inputs {
            let normalized = scopes.normalize(input);
            assert_eq!(normalized, first);
            assert_eq!(scopes.normalize([normalized.as_str()]), normalized);
        }
    }

    #[test]
    fn test_empty_input_yields_default() {
        let scopes = manager();
        assert_eq!(scopes.normalize(None::<&str>), "api_access");
        assert_eq!(scopes.normalize(["   "]), "api_access");
        assert_eq!(scopes.normalize(Vec::<String>::new()), "api_access");
    }

    #[test]
    fn test_cleared_default_yields_empty() {
        let scopes = ScopeManager::new("", "p", "s", "e");
        assert_eq!(scopes.normalize(None::<&str>), "");
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_discriminating() {
        let a = ScopeManager::fingerprint("payments_read");
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, ScopeManager::fingerprint("payments_read"));

        let combos = [
            "payments_read",
            "payments_write",
            "payments_read payments_write",
            "qr_create",
            "payments_read qr_create",
            "keys_register",
            "",
        ];
        let fingerprints: BTreeSet<String> =
            combos.iter().map(|c| ScopeManager::fingerprint(c)).collect();
        assert_eq!(fingerprints.len(), combos.len());
    }

    #[test]
    fn test_cache_key_layout() {
        let scopes = manager();
        let normalized = scopes.normalize(["b_1 a_1"]);
        let key = scopes.cache_key("client-1", &normalized);

        let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(&parts[..4], &["oauth2_token", "scopes", "sandbox", "client-1"]);
        assert_eq!(parts[4], ScopeManager::fingerprint("a_1 b_1"));
        assert!(key.starts_with(&scopes.client_prefix("client-1")));

        let same = scopes.cache_key("client-1", &scopes.normalize(["a_1", "b_1"]));
        assert_eq!(key, same);
    }

    #[test]
    fn test_compatible_is_subset_check() {
        assert!(ScopeManager::compatible("a_1 b_1 c_1", "a_1 c_1"));
        assert!(ScopeManager::compatible("a_1", "a_1"));
        assert!(!ScopeManager::compatible("a_1", "a_1 b_1"));
    }

    #[test]
    fn test_allowed() {
        let allowlist = vec!["a_1".to_string(), "b_1".to_string()];
        assert!(ScopeManager::allowed("a_1 b_1", None));
        assert!(ScopeManager::allowed("a_1", Some(&allowlist)));
        assert!(!ScopeManager::allowed("a_1 c_1", Some(&allowlist)));
    }

    #[test]
    fn test_scope_shape_validation_is_advisory() {
        assert!(ScopeManager::is_valid_scope("payments_read"));
        assert!(!ScopeManager::is_valid_scope("payments"));
        assert!(!ScopeManager::is_valid_scope("payments__read"));
        assert!(!ScopeManager::is_valid_scope("payments_read_all"));
        assert!(!ScopeManager::is_valid_scope("_read"));

        assert_eq!(
            ScopeManager::invalid_scopes("payments_read bogus a_b_c"),
            vec!["bogus".to_string(), "a_b_c".to_string()]
        );
    }
}
