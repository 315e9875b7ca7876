use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const PREFIX_ACCOUNTS: &str = "accounts:";
pub const PREFIX_AUDIENCES: &str = "audiences:";
pub const PREFIX_RECOMMENDATIONS: &str = "recs:";
pub const PREFIX_BENCHMARKS: &str = "benchmarks:";
pub const PREFIX_METRICS: &str = "metrics:";
pub const PREFIX_SETTINGS: &str = "settings:";

pub const TTL_ACCOUNTS: Duration = Duration::from_secs(300);
pub const TTL_AUDIENCES: Duration = Duration::from_secs(300);
pub const TTL_RECOMMENDATIONS: Duration = Duration::from_secs(600);
pub const TTL_BENCHMARKS: Duration = Duration::from_secs(1800);
pub const TTL_METRICS: Duration = Duration::from_secs(900);
pub const TTL_SETTINGS: Duration = Duration::from_secs(3600);

const FAR_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

// prefix + sha256(json(parts))
pub fn make_key(prefix: &str, parts: &serde_json::Value) -> String {
    let raw = parts.to_string();
    let digest = Sha256::digest(raw.as_bytes());
    format!("{}{}", prefix, hex::encode(digest))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub expired_keys: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheEntry {
    expires_at: Instant,
    value: serde_json::Value,
}

#[derive(Debug, Default)]
struct CacheInner {
    store: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Default)]
pub struct TtlCache {
    inner: Mutex<CacheInner>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // A panic while holding the lock cannot leave a half-written entry behind.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.lock();
        let now = Instant::now();
        let live = match inner.store.get(key) {
            None => None,
            Some(entry) if now >= entry.expires_at => {
                inner.store.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
        };

        let Some(value) = live else {
            inner.misses += 1;
            return None;
        };

        match serde_json::from_value::<T>(value) {
            Ok(decoded) => {
                inner.hits += 1;
                Some(decoded)
            }
            Err(error) => {
                tracing::debug!(key = %key, error = %error, "cached value has unexpected shape; evicting");
                inner.store.remove(key);
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(key = %key, error = %error, "value not cacheable");
                return;
            }
        };
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let mut inner = self.lock();
        inner.store.insert(key.to_string(), CacheEntry { expires_at, value });
    }

    pub fn delete(&self, key: &str) {
        self.lock().store.remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.store.len();
        inner.store.retain(|key, _| !key.starts_with(prefix));
        let removed = before - inner.store.len();
        if removed > 0 {
            tracing::debug!(prefix = %prefix, count = removed, "cache invalidated keys");
        }
        removed
    }

    pub fn invalidate_prefixes(&self, prefixes: &[&str]) -> usize {
        prefixes.iter().map(|prefix| self.invalidate_prefix(prefix)).sum()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.store.len();
        inner.store.clear();
        count
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let now = Instant::now();
        let active_keys = inner
            .store
            .values()
            .filter(|entry| entry.expires_at > now)
            .count();
        let lookups = (inner.hits + inner.misses).max(1);
        let hit_rate = (inner.hits as f64 / lookups as f64 * 1000.0).round() / 10.0;

        CacheStats {
            total_keys: inner.store.len(),
            active_keys,
            expired_keys: inner.store.len() - active_keys,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
        }
    }
}
