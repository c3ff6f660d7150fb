//! In-process cache interface
//!
//! Keys are structured, not strings: invalidation enumerates a keyspace
//! instead of scanning patterns. Values cross the trait as JSON so backends
//! stay format-agnostic; the typed wrappers live with the callers.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Structured cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// One server row, by id.
    Server(String),
    /// One list query result, by normalized filter key.
    ServerList(String),
    /// One server's tool set, by server id.
    ServerTools(String),
}

/// The keyspace a key belongs to, for targeted bulk invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyspace {
    Server,
    ServerList,
    ServerTools,
}

impl CacheKey {
    pub fn space(&self) -> CacheKeyspace {
        match self {
            CacheKey::Server(_) => CacheKeyspace::Server,
            CacheKey::ServerList(_) => CacheKeyspace::ServerList,
            CacheKey::ServerTools(_) => CacheKeyspace::ServerTools,
        }
    }
}

/// Abstract cache consumed by the registry and the catalog.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<serde_json::Value>;

    async fn put(&self, key: CacheKey, value: serde_json::Value, ttl: Duration);

    async fn invalidate(&self, key: &CacheKey);

    /// Drop every entry in one keyspace.
    async fn invalidate_space(&self, space: CacheKeyspace);
}

/// Default in-process cache with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, (Instant, serde_json::Value)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some((deadline, value)) if *deadline > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: CacheKey, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(key, (Instant::now() + ttl, value));
    }

    async fn invalidate(&self, key: &CacheKey) {
        self.entries.lock().expect("cache poisoned").remove(key);
    }

    async fn invalidate_space(&self, space: CacheKeyspace) {
        self.entries
            .lock()
            .expect("cache poisoned")
            .retain(|key, _| key.space() != space);
    }
}
