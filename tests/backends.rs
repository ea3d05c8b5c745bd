//! Storage contract against live backends.
//!
//! Set `TOKEN_CACHE_TEST_REDIS_URL` and/or `TOKEN_CACHE_TEST_DATABASE_URL`
//! to run the live checks; without them only the offline checks run.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use oauth2_token_cache::{
    token_cache_config, AdapterFactory, ConfigurationError, StorageAdapter, TokenCacheConfig,
    TokenCacheError, TokenRecord,
};

const ENCRYPTION_KEY: &str = "Integration-Test-Key-0123456789-abcdefghijkl";

fn config(adapter: &str, url: Option<String>) -> TokenCacheConfig {
    let mut builder = token_cache_config()
        .client_id("svc-backend-test")
        .client_secret("secret")
        .token_endpoint("https://auth.example.com/oauth/token")
        .storage_adapter(adapter)
        .encryption_key(ENCRYPTION_KEY);
    if let Some(url) = url {
        builder = builder.storage_url(url);
    }
    builder.build().unwrap()
}

fn record(token: &str, lifetime_secs: i64) -> TokenRecord {
    let now = Utc::now();
    TokenRecord {
        access_token: token.to_string(),
        scope: "read_things".to_string(),
        expires_at: now + chrono::Duration::seconds(lifetime_secs),
        client_id: "svc-backend-test".to_string(),
        created_at: now,
    }
}

fn unique_prefix() -> String {
    format!("it:{}:", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

async fn exercise_contract(storage: Arc<dyn StorageAdapter>) {
    let prefix = unique_prefix();
    let a = format!("{}a", prefix);
    let b = format!("{}b", prefix);

    assert!(storage.healthy().await);
    assert!(storage.retrieve(&a).await.unwrap().is_none());

    assert_ok!(storage.store(&a, &record("token-a", 120), 120).await);
    assert_ok!(storage.store(&b, &record("token-b", 120), 120).await);
    assert_eq!(storage.retrieve(&a).await.unwrap().unwrap().access_token, "token-a");
    assert!(storage.exists(&b).await.unwrap());

    // Overwrite replaces the whole record.
    storage.store(&a, &record("token-a2", 120), 120).await.unwrap();
    assert_eq!(storage.retrieve(&a).await.unwrap().unwrap().access_token, "token-a2");

    // Non-positive TTL leaves the key absent.
    storage.store(&b, &record("gone", 0), 0).await.unwrap();
    assert!(storage.retrieve(&b).await.unwrap().is_none());

    assert!(storage.delete(&a).await.unwrap());
    assert!(!storage.delete(&a).await.unwrap());

    storage.store(&a, &record("x", 120), 120).await.unwrap();
    storage.store(&b, &record("y", 120), 120).await.unwrap();
    let a_lock = format!("{}:lock", a);
    let refreshing = storage
        .acquire_lock(&a_lock, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("uncontended lock");
    assert_eq!(storage.clear_all(&prefix).await.unwrap(), 2);
    assert!(!storage.exists(&a).await.unwrap());
    // Clearing tokens leaves an in-flight refresh lock with its owner.
    assert!(storage
        .acquire_lock(&a_lock, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert!(storage.release_lock(&refreshing).await.unwrap());

    let lock_key = format!("{}refresh:lock", prefix);
    let held = storage
        .acquire_lock(&lock_key, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("uncontended lock");
    assert!(storage
        .acquire_lock(&lock_key, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert!(storage.release_lock(&held).await.unwrap());
    assert!(!storage.release_lock(&held).await.unwrap());

    let again = storage
        .acquire_lock(&lock_key, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("lock free after release");
    storage.release_lock(&again).await.unwrap();

    assert_ok!(storage.cleanup_expired().await);
}

#[cfg(feature = "redis")]
#[tokio::test]
async fn test_redis_contract() {
    let Ok(url) = std::env::var("TOKEN_CACHE_TEST_REDIS_URL") else {
        return;
    };
    let storage = AdapterFactory::create(&config("redis", Some(url))).await.unwrap();
    assert_eq!(storage.name(), "redis");
    exercise_contract(storage).await;
}

#[cfg(feature = "postgres")]
#[tokio::test]
async fn test_database_contract() {
    let Ok(url) = std::env::var("TOKEN_CACHE_TEST_DATABASE_URL") else {
        return;
    };
    let storage = AdapterFactory::create(&config("postgres", Some(url))).await.unwrap();
    assert_eq!(storage.name(), "database");
    exercise_contract(storage).await;
}

#[tokio::test]
async fn test_memory_contract() {
    let storage = AdapterFactory::create(&config("memory", None)).await.unwrap();
    exercise_contract(storage).await;
}

#[cfg(feature = "redis")]
#[tokio::test]
async fn test_redis_without_url_is_rejected() {
    let Err(error) = AdapterFactory::create(&config("redis", None)).await else {
        panic!("redis without a URL must be rejected");
    };
    assert!(matches!(
        error,
        TokenCacheError::Configuration(ConfigurationError::MissingConnectionUrl { .. })
    ));
    assert!(error.to_string().contains("URL"));
}
