//! Distributed key-value cache abstraction.
//!
//! The tile orchestrator talks to a shared cache (Redis-like) through the
//! [`DistributedCache`] trait: byte values with a TTL, prefix scans for the
//! size guardrail, and an advisory compare-and-set lock. Locks are
//! best-effort and expire on their own, so a crashed holder never blocks a
//! key forever.
//!
//! [`MemoryDistributedCache`] is a single-process implementation used for
//! local runs and tests. It can be switched offline to simulate an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::CacheError;

/// A shared byte cache with TTLs and advisory locks.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Fetches the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Lists live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Size in bytes of the value stored under `key`.
    async fn value_len(&self, key: &str) -> Result<Option<usize>, CacheError>;

    /// Attempts to take the advisory lock `key` for `owner`.
    ///
    /// Returns `false` when another owner holds an unexpired lock.
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Releases `key` if it is still held by `owner`.
    async fn unlock(&self, key: &str, owner: &str) -> Result<(), CacheError>;
}

struct StoredValue {
    bytes: Vec<u8>,
    ttl: Duration,
    expires_at: Instant,
}

struct HeldLock {
    owner: String,
    expires_at: Instant,
}

/// Call counters for [`MemoryDistributedCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
}

/// In-process [`DistributedCache`].
#[derive(Default)]
pub struct MemoryDistributedCache {
    values: Mutex<HashMap<String, StoredValue>>,
    locks: Mutex<HashMap<String, HeldLock>>,
    offline: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryDistributedCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`CacheError::Unavailable`]
    /// until set back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            gets: self.gets.load(Ordering::SeqCst),
            sets: self.sets.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Stores raw bytes without going through the async API.
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                StoredValue {
                    bytes,
                    ttl,
                    expires_at: Instant::now() + ttl,
                },
            );
    }

    /// Whether an unexpired value exists for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|v| v.expires_at > Instant::now())
    }

    /// TTL the unexpired value under `key` was written with.
    #[must_use]
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|v| v.expires_at > Instant::now())
            .map(|v| v.ttl)
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("memory cache offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match values.get(key) {
            Some(v) if v.expires_at > now => Ok(Some(v.bytes.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.check_online()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, v)| key.starts_with(prefix) && v.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn value_len(&self, key: &str) -> Result<Option<usize>, CacheError> {
        self.check_online()?;
        let now = Instant::now();
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.bytes.len()))
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check_online()?;
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let contended = locks
            .get(key)
            .is_some_and(|held| held.expires_at > now && held.owner != owner);
        if contended {
            return Ok(false);
        }
        locks.insert(
            key.to_string(),
            HeldLock {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), CacheError> {
        self.check_online()?;
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|held| held.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }
}
