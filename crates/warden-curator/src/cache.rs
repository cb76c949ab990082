//! Decision cache using moka
//!
//! Reviews of identical (target, code) pairs under one gate always produce
//! the same decision, so repeated submissions can skip the micro check.

use crate::decision::Decision;
use moka::future::Cache;
use std::time::Duration;
use warden_artifact::ContentHash;

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// Bounded, optionally expiring map from review key to decision
#[derive(Debug, Clone)]
pub struct DecisionCache {
    inner: Cache<ContentHash, Decision>,
}

impl DecisionCache {
    /// Create cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Create cache with time-based expiration
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Cached decision for `key`
    pub async fn get(&self, key: &ContentHash) -> Option<Decision> {
        self.inner.get(key).await
    }

    /// Remember a decision
    pub async fn insert(&self, key: ContentHash, decision: Decision) {
        self.inner.insert(key, decision).await;
    }

    /// Drop every entry
    #[inline]
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Get cache statistics
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_get() {
        let cache = DecisionCache::new(8);
        let key = ContentHash::compute(b"k");
        assert!(cache.get(&key).await.is_none());
        cache.insert(key, Decision::internal("x")).await;
        assert_eq!(cache.get(&key).await, Some(Decision::internal("x")));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let cache = DecisionCache::with_ttl(8, Duration::from_millis(50));
        let key = ContentHash::compute(b"k");
        cache.insert(key, Decision::internal("x")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&key).await.is_none());
    }
}
