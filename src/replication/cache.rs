//! Inbound manifest cache (spec.md §4.7)
//!
//! "An optional driver caches upstream manifest bodies by (host, repo,
//! reference) with a time-bounded TTL supplied by the driver;
//! replication consults it before hitting the upstream. Cache misses
//! always fall through; cache storage errors are non-fatal." Grounded
//! on the same trait-seam-with-no-op-default shape as `storage::fs`'s
//! relationship to `storage::StorageDriver`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key a cached manifest body by upstream host, repo name, and the
/// reference (tag or digest) the pull requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub repo_name: String,
    pub reference: String,
}

/// Cache seam for upstream manifest bodies. Implementations must treat
/// their own I/O failures as cache misses rather than propagating them,
/// since a broken cache must never block replication.
#[async_trait]
pub trait InboundCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<(String, Vec<u8>)>;
    async fn put(&self, key: CacheKey, media_type: String, body: Vec<u8>);
}

struct Entry {
    media_type: String,
    body: Vec<u8>,
    expires_at: Instant,
}

/// In-memory TTL cache; the default `InboundCache` when no external
/// driver is configured.
pub struct MemoryInboundCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl MemoryInboundCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl InboundCache for MemoryInboundCache {
    async fn get(&self, key: &CacheKey) -> Option<(String, Vec<u8>)> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                Some((entry.media_type.clone(), entry.body.clone()))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: CacheKey, media_type: String, body: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, Entry { media_type, body, expires_at: Instant::now() + self.ttl });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey {
            host: "upstream.example.org".to_string(),
            repo_name: "library/nginx".to_string(),
            reference: "latest".to_string(),
        }
    }

    #[tokio::test]
    async fn stores_and_returns_entries_within_ttl() {
        let cache = MemoryInboundCache::new(Duration::from_secs(60));
        cache.put(key(), "application/json".to_string(), b"{}".to_vec()).await;
        let hit = cache.get(&key()).await;
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().1, b"{}".to_vec());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = MemoryInboundCache::new(Duration::from_millis(1));
        cache.put(key(), "application/json".to_string(), b"{}".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn miss_on_unknown_key() {
        let cache = MemoryInboundCache::new(Duration::from_secs(60));
        assert!(cache.get(&key()).await.is_none());
    }
}
