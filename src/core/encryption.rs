//! Record Encryption
//!
//! Authenticated envelope encryption for cached records.
//!
//! Each call derives a fresh AES-256-GCM key from the configured passphrase
//! with PBKDF2-HMAC-SHA256 over a random 32-byte salt and encrypts under a
//! random 12-byte IV. A fixed domain string is bound in as additional
//! authenticated data. Envelopes carry their version and algorithm; readers
//! refuse envelopes they do not understand before touching the ciphertext.

use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use ring::{aead, pbkdf2};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

use crate::error::{ConfigurationError, TokenCacheError};

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;
/// Envelope algorithm identifier.
pub const ALGORITHM: &str = "aes-256-gcm";
/// Additional authenticated data bound into every envelope.
pub const AAD: &[u8] = b"oauth2-token-cache:v1";
/// PBKDF2 salt length.
pub const SALT_LEN: usize = 32;
/// AES-GCM IV length.
pub const IV_LEN: usize = 12;
/// AES-GCM tag length.
pub const TAG_LEN: usize = 16;
/// Minimum passphrase length.
pub const MIN_KEY_LENGTH: usize = 32;
/// Length of keys produced by [`generate_key`].
pub const GENERATED_KEY_LENGTH: usize = 48;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => unreachable!(),
};

const REQUIRED_FIELDS: [&str; 7] = [
    "encrypted",
    "version",
    "algorithm",
    "salt",
    "iv",
    "auth_tag",
    "ciphertext",
];

/// Versioned container for an encrypted record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    pub version: u32,
    pub algorithm: String,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub encrypted_at: DateTime<Utc>,
}

impl EncryptedEnvelope {
    /// Check whether a raw JSON value looks like an envelope.
    pub fn is_envelope(value: &serde_json::Value) -> bool {
        value.get("encrypted").and_then(|v| v.as_bool()) == Some(true)
    }
}

/// Encrypt a JSON value.
pub fn encrypt(data: &serde_json::Value, key: &str) -> Result<EncryptedEnvelope, TokenCacheError> {
    validate_key(key)?;

    let plaintext = serde_json::to_vec(data).map_err(|e| {
        TokenCacheError::invalid_config(format!("record is not serializable: {}", e))
    })?;

    let mut salt = vec![0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let cipher = derive_cipher(key, &salt)?;
    let mut in_out = plaintext;
    let tag = cipher
        .seal_in_place_separate_tag(
            aead::Nonce::assume_unique_for_key(iv),
            aead::Aad::from(AAD),
            &mut in_out,
        )
        .map_err(|_| TokenCacheError::invalid_config("encryption failed"))?;

    Ok(EncryptedEnvelope {
        encrypted: true,
        version: ENVELOPE_VERSION,
        algorithm: ALGORITHM.to_string(),
        salt,
        iv: iv.to_vec(),
        auth_tag: tag.as_ref().to_vec(),
        ciphertext: in_out,
        encrypted_at: Utc::now(),
    })
}

/// Decrypt an envelope back into the JSON value it wraps.
///
/// Version and algorithm are checked before any decryption attempt. A wrong
/// key or tampered bytes fail the integrity check and surface as
/// `Unauthorized`; structural problems surface as configuration errors.
pub fn decrypt(
    envelope: &EncryptedEnvelope,
    key: &str,
) -> Result<serde_json::Value, TokenCacheError> {
    validate_key(key)?;

    if !envelope.encrypted {
        return Err(malformed("envelope is not marked as encrypted"));
    }
    if envelope.version != ENVELOPE_VERSION || envelope.algorithm != ALGORITHM {
        return Err(TokenCacheError::Configuration(
            ConfigurationError::UnsupportedEnvelope {
                version: envelope.version,
                algorithm: envelope.algorithm.clone(),
            },
        ));
    }
    if envelope.salt.len() != SALT_LEN {
        return Err(malformed("invalid salt length"));
    }
    if envelope.iv.len() != IV_LEN {
        return Err(malformed("invalid iv length"));
    }
    if envelope.auth_tag.len() != TAG_LEN {
        return Err(malformed("invalid auth tag length"));
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&envelope.iv);

    let cipher = derive_cipher(key, &envelope.salt)?;
    let mut in_out = Vec::with_capacity(envelope.ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(&envelope.ciphertext);
    in_out.extend_from_slice(&envelope.auth_tag);

    let plaintext = cipher
        .open_in_place(
            aead::Nonce::assume_unique_for_key(iv),
            aead::Aad::from(AAD),
            &mut in_out,
        )
        .map_err(|_| TokenCacheError::unauthorized("decryption failed: integrity check failed"))?;

    serde_json::from_slice(plaintext)
        .map_err(|e| malformed(format!("decrypted payload is not JSON: {}", e)))
}

/// Decrypt a raw JSON envelope, reporting missing fields as configuration errors.
pub fn decrypt_value(
    raw: &serde_json::Value,
    key: &str,
) -> Result<serde_json::Value, TokenCacheError> {
    let object = raw
        .as_object()
        .ok_or_else(|| malformed("envelope must be a JSON object"))?;

    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(malformed(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let envelope: EncryptedEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| malformed(format!("invalid envelope: {}", e)))?;

    decrypt(&envelope, key)
}

/// Serialize and encrypt a typed record.
pub fn encrypt_record<T: Serialize>(
    record: &T,
    key: &str,
) -> Result<EncryptedEnvelope, TokenCacheError> {
    let value = serde_json::to_value(record).map_err(|e| {
        TokenCacheError::invalid_config(format!("record is not serializable: {}", e))
    })?;
    encrypt(&value, key)
}

/// Decrypt and deserialize a typed record.
pub fn decrypt_record<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope,
    key: &str,
) -> Result<T, TokenCacheError> {
    let value = decrypt(envelope, key)?;
    serde_json::from_value(value)
        .map_err(|e| malformed(format!("decrypted record has unexpected shape: {}", e)))
}

/// Check a passphrase against the key-strength policy.
pub fn validate_key(key: &str) -> Result<(), TokenCacheError> {
    let reason = if key.is_empty() {
        Some("encryption key is empty")
    } else if key.trim() != key {
        Some("encryption key must not have leading or trailing whitespace")
    } else if key.chars().count() < MIN_KEY_LENGTH {
        Some("encryption key is shorter than 32 characters")
    } else if !key.chars().any(|c| c.is_ascii_alphabetic()) || !key.chars().any(|c| c.is_ascii_digit())
    {
        Some("encryption key must contain both letters and digits")
    } else if !key.chars().any(|c| c.is_lowercase()) || !key.chars().any(|c| c.is_uppercase()) {
        Some("encryption key must mix upper and lower case")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(TokenCacheError::Configuration(
            ConfigurationError::InvalidEncryptionKey {
                reason: reason.to_string(),
            },
        )),
        None => Ok(()),
    }
}

/// Generate a random key that satisfies the strength policy.
pub fn generate_key() -> String {
    use rand::distributions::{Alphanumeric, DistString};

    loop {
        let candidate = Alphanumeric.sample_string(&mut rand::thread_rng(), GENERATED_KEY_LENGTH);
        if validate_key(&candidate).is_ok() {
            return candidate;
        }
    }
}

fn derive_cipher(key: &str, salt: &[u8]) -> Result<aead::LessSafeKey, TokenCacheError> {
    let mut derived = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        key.as_bytes(),
        &mut derived,
    );

    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &derived)
        .map_err(|_| TokenCacheError::invalid_config("failed to initialise cipher"))?;
    Ok(aead::LessSafeKey::new(unbound))
}

fn malformed(message: impl Into<String>) -> TokenCacheError {
    TokenCacheError::Configuration(ConfigurationError::MalformedEnvelope {
        message: message.into(),
    })
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
