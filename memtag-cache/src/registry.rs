//! Named cache instances.
//!
//! One registry is built by the application at start-up and handed to
//! whatever needs a cache; there is no global lookup.

use crate::cache::TaggedCache;
use crate::codec::{JsonSerializer, Serializer};
use crate::config::DEFAULT_CONNECTION_NAME;
use crate::traits::CacheBackend;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Registry of caches keyed by connection name.
pub struct CacheRegistry<B, S = JsonSerializer> {
    caches: RwLock<IndexMap<String, Arc<TaggedCache<B, S>>>>,
}

impl<B: CacheBackend, S: Serializer> CacheRegistry<B, S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(IndexMap::new()),
        }
    }

    /// Register a cache under its connection name, replacing any previous
    /// cache of that name.
    pub fn insert(&self, cache: TaggedCache<B, S>) -> Arc<TaggedCache<B, S>> {
        let name = cache.name().to_string();
        let cache = Arc::new(cache);
        if self
            .caches
            .write()
            .insert(name.clone(), cache.clone())
            .is_some()
        {
            memtag_log::debug!(target: "memtag::registry", "Replaced cache '{}'", name);
        }
        cache
    }

    /// Get a cache by connection name.
    pub fn get(&self, name: &str) -> Option<Arc<TaggedCache<B, S>>> {
        self.caches.read().get(name).cloned()
    }

    /// Get the cache named `default`.
    pub fn default_cache(&self) -> Option<Arc<TaggedCache<B, S>>> {
        self.get(DEFAULT_CONNECTION_NAME)
    }

    /// Get a cache by name, building it with `create` on first use.
    pub fn get_or_insert_with<F>(&self, name: &str, create: F) -> Arc<TaggedCache<B, S>>
    where
        F: FnOnce() -> TaggedCache<B, S>,
    {
        if let Some(cache) = self.get(name) {
            return cache;
        }
        self.caches
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Remove a cache. Handles already given out keep working.
    pub fn remove(&self, name: &str) -> Option<Arc<TaggedCache<B, S>>> {
        self.caches.write().shift_remove(name)
    }

    /// Number of registered caches.
    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    /// Whether no cache is registered.
    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }
}

impl<B: CacheBackend, S: Serializer> Default for CacheRegistry<B, S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::memory::InMemoryBackend;

    fn named(name: &str) -> TaggedCache<InMemoryBackend> {
        let config = ConnectionConfig::builder().name(name).build().unwrap();
        TaggedCache::new(InMemoryBackend::new(), config)
    }

    #[test]
    fn test_insert_and_get() {
        let registry = CacheRegistry::new();
        registry.insert(named("default"));
        registry.insert(named("sessions"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("sessions").unwrap().name(), "sessions");
        assert!(registry.default_cache().is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["default", "sessions"]);
    }

    #[test]
    fn test_get_or_insert_with_builds_once() {
        let registry = CacheRegistry::new();
        let first = registry.get_or_insert_with("pages", || named("pages"));
        let second = registry.get_or_insert_with("pages", || panic!("built twice"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_remove_keeps_handles_alive() {
        let registry = CacheRegistry::new();
        let handle = registry.insert(named("tmp"));

        let removed = registry.remove("tmp").unwrap();
        assert!(Arc::ptr_eq(&handle, &removed));
        assert!(registry.is_empty());
        assert_eq!(handle.name(), "tmp");
    }

    #[tokio::test]
    async fn test_shared_cache_across_tasks() {
        let registry = Arc::new(CacheRegistry::new());
        registry.insert(named("default"));

        let writer = registry.clone();
        tokio::spawn(async move {
            let cache = writer.default_cache().unwrap();
            cache.save("k", &"v", None, &["t"]).await.unwrap();
        })
        .await
        .unwrap();

        let cache = registry.default_cache().unwrap();
        assert!(cache.has("k").await.unwrap());
    }
}
