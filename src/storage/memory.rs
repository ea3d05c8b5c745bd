//! In-Memory Storage
//!
//! Process-local backend. Entries are not shared between processes, so every
//! process refreshes its own tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

use super::{RecordCodec, StorageAdapter};
use crate::error::TokenCacheResult;
use crate::types::token::after;
use crate::types::{LockRecord, TokenCacheConfig, TokenRecord};

static LOCAL_STORAGE_WARNING: Once = Once::new();

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, String>,
    expiries: HashMap<String, DateTime<Utc>>,
    locks: HashMap<String, LockRecord>,
}

impl MemoryState {
    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            self.expiries.remove(&key);
            self.entries.remove(&key);
        }

        self.locks.retain(|_, lock| lock.expires_at > now);
    }
}

/// In-memory storage adapter.
pub struct MemoryStorageAdapter {
    state: Mutex<MemoryState>,
    codec: RecordCodec,
}

impl MemoryStorageAdapter {
    /// Create new in-memory storage.
    pub fn new(codec: RecordCodec) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            codec,
        }
    }

    /// Create in-memory storage from configuration, warning once per process
    /// that tokens will not be shared.
    pub fn from_config(config: &TokenCacheConfig) -> Self {
        if config.cache.warn_on_local_storage {
            LOCAL_STORAGE_WARNING.call_once(|| {
                warn!(
                    "using process-local token storage; tokens are not shared between processes \
                     and each process refreshes independently"
                );
            });
        }
        Self::new(RecordCodec::from_config(config))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.sweep(Utc::now());
        state.entries.len()
    }

    /// Check if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorageAdapter {
    fn default() -> Self {
        Self::new(RecordCodec::plaintext())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn store(
        &self,
        key: &str,
        record: &TokenRecord,
        ttl_seconds: i64,
    ) -> TokenCacheResult<bool> {
        let encoded = self.codec.encode(record)?;
        let now = Utc::now();
        let expires_at = after(now, Duration::from_secs(ttl_seconds.max(0) as u64));

        let mut state = self.state.lock();
        state.entries.insert(key.to_string(), encoded);
        state.expiries.insert(key.to_string(), expires_at);
        state.sweep(now);

        debug!(key = %key, ttl_seconds, "stored token in memory");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> TokenCacheResult<Option<TokenRecord>> {
        let raw = {
            let mut state = self.state.lock();
            state.sweep(Utc::now());
            state.entries.get(key).cloned()
        };

        match raw {
            Some(raw) => self.codec.decode(&raw),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> TokenCacheResult<bool> {
        let mut state = self.state.lock();
        state.sweep(Utc::now());
        Ok(state.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> TokenCacheResult<bool> {
        let mut state = self.state.lock();
        state.expiries.remove(key);
        Ok(state.entries.remove(key).is_some())
    }

    async fn clear_all(&self, prefix: &str) -> TokenCacheResult<u64> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            state.entries.remove(key);
            state.expiries.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn healthy(&self) -> bool {
        true
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> TokenCacheResult<Option<LockRecord>> {
        let mut state = self.state.lock();
        state.sweep(Utc::now());

        if state.locks.contains_key(key) {
            return Ok(None);
        }

        let lock = LockRecord::new(key, ttl);
        state.locks.insert(key.to_string(), lock.clone());
        Ok(Some(lock))
    }

    async fn release_lock(&self, lock: &LockRecord) -> TokenCacheResult<bool> {
        let mut state = self.state.lock();
        let owned = state
            .locks
            .get(&lock.lock_key)
            .map(|held| held.owner == lock.owner)
            .unwrap_or(false);

        if owned {
            state.locks.remove(&lock.lock_key);
        }
        Ok(owned)
    }

    async fn cleanup_expired(&self) -> TokenCacheResult<u64> {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.sweep(Utc::now());
        Ok((before - state.entries.len()) as u64)
    }
}
