// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! TTL cache for decrypted sensitive values, so a given ciphertext is only
//! decrypted once per merge pass. Narrowed from the teacher's backend-generic
//! secret cache since there is no remaining store abstraction to wrap.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedValue {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A thread-safe, TTL-bounded cache mapping a ciphertext (the cache key) to
/// its decrypted plaintext.
pub struct DecryptedValueCache {
    entries: Arc<RwLock<HashMap<String, CachedValue>>>,
    ttl: Duration,
    stats: Arc<RwLock<CacheStats>>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl DecryptedValueCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::minutes(5))
    }

    /// Returns the cached plaintext for `ciphertext` if present and unexpired.
    pub fn get(&self, ciphertext: &str) -> Option<String> {
        let entries = self.entries.read();
        match entries.get(ciphertext) {
            Some(cached) if !cached.is_expired() => {
                trace!("decrypted-value cache hit");
                self.stats.write().hits += 1;
                Some(cached.value.clone())
            }
            Some(_) => {
                drop(entries);
                self.stats.write().expirations += 1;
                None
            }
            None => {
                self.stats.write().misses += 1;
                None
            }
        }
    }

    pub fn put(&self, ciphertext: impl Into<String>, plaintext: impl Into<String>) {
        let expires_at = Utc::now() + self.ttl;
        self.entries.write().insert(
            ciphertext.into(),
            CachedValue {
                value: plaintext.into(),
                expires_at,
            },
        );
    }

    pub fn cleanup_expired(&self) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired());
        let removed = before - entries.len();
        if removed > 0 {
            debug!("cleaned up {removed} expired decrypted-value cache entries");
            self.stats.write().expirations += removed as u64;
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_hit() {
        let cache = DecryptedValueCache::with_default_ttl();
        assert!(cache.get("ct").is_none());
        cache.put("ct", "plain");
        assert_eq!(cache.get("ct"), Some("plain".to_string()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expiration() {
        let cache = DecryptedValueCache::new(Duration::milliseconds(-1));
        cache.put("ct", "plain");
        assert!(cache.get("ct").is_none());
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = DecryptedValueCache::new(Duration::milliseconds(-1));
        cache.put("a", "1");
        cache.put("b", "2");
        cache.cleanup_expired();
        assert_eq!(cache.len(), 0);
    }
}
