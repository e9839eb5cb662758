// Result cache for completed analyses
//
// Keyed by sha256(question:max_results); entries expire after the TTL and the
// least-accessed entry is evicted when the store is full. Only fully
// successful analyses are stored (the streaming facade enforces that rule).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CacheConfig;

struct CacheEntry {
    result: Value,
    created: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() > ttl
    }
}

/// Cache metrics surfaced through `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub last_invalidation: Option<DateTime<Utc>>,
}

/// TTL + least-accessed-eviction cache over analysis results
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
    last_invalidation: Mutex<Option<DateTime<Utc>>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_seconds),
            max_size: config.max_size.max(1),
            last_invalidation: Mutex::new(None),
        }
    }

    /// Deterministic key for a question at a result limit
    pub fn cache_key(question: &str, max_results: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(question.as_bytes());
        hasher.update(b":");
        hasher.update(max_results.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Return the cached result if present and fresh; expired entries are
    /// removed on the way out.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(self.ttl) => {
                entries.remove(key);
                None
            }
            Some(entry) => {
                entry.access_count += 1;
                Some(entry.result.clone())
            }
            None => None,
        }
    }

    /// Store a result, evicting the least-accessed entry when full
    pub async fn set(&self, key: String, result: Value) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
                tracing::debug!("cache evicted least-accessed entry");
            }
        }
        entries.insert(
            key,
            CacheEntry {
                result,
                created: Instant::now(),
                access_count: 0,
            },
        );
    }

    /// Drop every entry and record the invalidation time
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
        *self.last_invalidation.lock().await = Some(Utc::now());
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.lock().await.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
            last_invalidation: *self.last_invalidation.lock().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(ttl_seconds: u64, max_size: usize) -> QueryCache {
        QueryCache::new(CacheConfig {
            ttl_seconds,
            max_size,
        })
    }

    #[test]
    fn keys_are_deterministic_and_parameter_sensitive() {
        let a = QueryCache::cache_key("최근 1시간 에러 로그", 100);
        let b = QueryCache::cache_key("최근 1시간 에러 로그", 100);
        let c = QueryCache::cache_key("최근 1시간 에러 로그", 50);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn get_returns_stored_value_within_ttl() {
        let cache = cache(300, 10);
        let key = QueryCache::cache_key("q", 100);
        cache.set(key.clone(), json!({"count": 3})).await;
        assert_eq!(cache.get(&key).await, Some(json!({"count": 3})));
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_get() {
        let cache = cache(0, 10);
        let key = QueryCache::cache_key("q", 100);
        cache.set(key.clone(), json!(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get(&key).await, None);
        assert_eq!(cache.stats().await.size, 0, "expired entry removed");
    }

    #[tokio::test]
    async fn eviction_removes_least_accessed() {
        let cache = cache(300, 2);
        cache.set("hot".to_string(), json!("hot")).await;
        cache.set("cold".to_string(), json!("cold")).await;

        // Touch "hot" so "cold" has the lowest access count
        cache.get("hot").await;
        cache.get("hot").await;

        cache.set("new".to_string(), json!("new")).await;
        assert_eq!(cache.get("cold").await, None, "cold entry evicted");
        assert!(cache.get("hot").await.is_some());
        assert!(cache.get("new").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_all_clears_and_stamps() {
        let cache = cache(300, 10);
        cache.set("k".to_string(), json!(1)).await;
        cache.invalidate_all().await;

        assert_eq!(cache.get("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert!(stats.last_invalidation.is_some());
    }
}
