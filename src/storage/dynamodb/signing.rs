//! AWS Signature V4 signing for DynamoDB JSON requests.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::error::{ConfigurationError, TokenCacheError, TokenCacheResult};
use crate::types::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature V4 algorithm identifier.
pub const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Service name for DynamoDB.
pub const DYNAMODB_SERVICE: &str = "dynamodb";

/// Static AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: SecretString,
    session_token: Option<SecretString>,
}

impl AwsCredentials {
    /// Create credentials.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::new(secret_access_key.into()),
            session_token: session_token.map(SecretString::new),
        }
    }

    /// Credentials from storage settings, falling back to the standard
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
    /// environment variables.
    pub fn from_storage_config(storage: &StorageConfig) -> TokenCacheResult<Self> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let access_key_id = storage
            .access_key_id
            .clone()
            .or_else(|| env("AWS_ACCESS_KEY_ID"))
            .ok_or_else(|| missing("storage.access_key_id (or AWS_ACCESS_KEY_ID)"))?;

        let secret_access_key = match &storage.secret_access_key {
            Some(secret) => secret.clone(),
            None => env("AWS_SECRET_ACCESS_KEY")
                .map(SecretString::new)
                .ok_or_else(|| missing("storage.secret_access_key (or AWS_SECRET_ACCESS_KEY)"))?,
        };

        let session_token = storage
            .session_token
            .clone()
            .or_else(|| env("AWS_SESSION_TOKEN").map(SecretString::new));

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    /// Access key id.
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Session token, if any.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_ref().map(|t| t.expose_secret().as_str())
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

fn missing(field: &str) -> TokenCacheError {
    TokenCacheError::Configuration(ConfigurationError::MissingRequired {
        field: field.to_string(),
    })
}

/// Calculate SHA-256 hash of data.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Calculate HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never takes the error path.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Generate the signing key for AWS Signature V4.
///
/// kDate = HMAC("AWS4" + SecretKey, Date)
/// kRegion = HMAC(kDate, Region)
/// kService = HMAC(kRegion, Service)
/// kSigning = HMAC(kService, "aws4_request")
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{}", secret_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Format a timestamp as `YYYYMMDD'T'HHMMSS'Z'`.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Format a date stamp as `YYYYMMDD`.
pub fn format_date_stamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%d").to_string()
}

/// Sign a POST to the service root and add `x-amz-date`, `authorization`
/// and, with temporary credentials, `x-amz-security-token` to `headers`.
///
/// `headers` must already carry `host`; every header present is signed.
pub fn sign_request(
    headers: &mut HashMap<String, String>,
    body: &str,
    credentials: &AwsCredentials,
    region: &str,
    timestamp: &DateTime<Utc>,
) {
    let date_stamp = format_date_stamp(timestamp);
    let amz_date = format_datetime(timestamp);

    headers.insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = credentials.session_token() {
        headers.insert("x-amz-security-token".to_string(), token.to_string());
    }

    let canonical: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_lowercase(),
                value.split_whitespace().collect::<Vec<_>>().join(" "),
            )
        })
        .collect();

    let canonical_headers: String = canonical
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");
    let payload_hash = sha256_hex(body.as_bytes());

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, region, DYNAMODB_SERVICE
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        AWS_ALGORITHM,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        credentials.secret_access_key.expose_secret(),
        &date_stamp,
        region,
        DYNAMODB_SERVICE,
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    headers.insert(
        "authorization".to_string(),
        format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            AWS_ALGORITHM, credentials.access_key_id, credential_scope, signed_headers, signature
        ),
    );
}
