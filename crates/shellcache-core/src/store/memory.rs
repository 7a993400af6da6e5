use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ensure_cacheable, CacheStorage};
use crate::error::StoreError;
use crate::request::Response;

type Store = BTreeMap<String, Response>;

/// In-process cache storage.
#[derive(Default)]
pub struct MemoryStorage {
    caches: RwLock<BTreeMap<String, Store>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<(), StoreError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<Response>, StoreError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .and_then(|store| store.get(key))
            .cloned())
    }

    async fn put(&self, name: &str, key: &str, response: &Response) -> Result<(), StoreError> {
        ensure_cacheable(key, response)?;
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), response.clone());
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .caches
            .read()
            .await
            .get(name)
            .map(|store| store.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.open("a").await.expect("open");
        storage
            .put("a", "/x", &Response::new(200, "x"))
            .await
            .expect("put");
        storage.open("a").await.expect("reopen");
        assert!(storage.match_entry("a", "/x").await.expect("match").is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let storage = MemoryStorage::new();
        storage.put("a", "/x", &Response::new(200, "one")).await.expect("put");
        storage.put("a", "/x", &Response::new(200, "two")).await.expect("put");
        let hit = storage.match_entry("a", "/x").await.expect("match").expect("hit");
        assert_eq!(hit.body, b"two");
    }

    #[tokio::test]
    async fn test_put_refuses_failed_responses() {
        let storage = MemoryStorage::new();
        let err = storage.put("a", "/x", &Response::new(500, "boom")).await;
        assert!(matches!(err, Err(StoreError::NotCacheable { status: 500, .. })));
        assert!(storage
            .put("a", "/x", &Response::network_error())
            .await
            .is_err());
        assert!(!storage.has("a").await.expect("has"));
    }

    #[tokio::test]
    async fn test_missing_store_is_a_miss() {
        let storage = MemoryStorage::new();
        assert!(storage.match_entry("nope", "/").await.expect("match").is_none());
        assert!(storage.entries("nope").await.expect("entries").is_empty());
        assert!(!storage.delete("nope").await.expect("delete"));
    }

    #[tokio::test]
    async fn test_keys_are_sorted() {
        let storage = MemoryStorage::new();
        storage.open("b").await.expect("open");
        storage.open("a").await.expect("open");
        assert_eq!(storage.keys().await.expect("keys"), vec!["a", "b"]);
    }
}
