//! Named key-value cache stores.
//!
//! This module provides the `CacheStorage` trait the router and the lifecycle
//! manager share, plus two backends:
//! - `MemoryStorage`: process-local, used by tests and ephemeral proxies
//! - `DiskStorage`: one directory per store, survives restarts
//!
//! Only successful responses are ever persisted; `put` refuses anything else.

pub mod disk;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::request::Response;

pub use disk::{CachedEntry, DiskStorage};
pub use memory::MemoryStorage;

#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the store if absent.
    async fn open(&self, name: &str) -> Result<(), StoreError>;

    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of every existing store, sorted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Remove a store and all its entries. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Look up an entry. A missing store is a miss, not an error.
    async fn match_entry(&self, name: &str, key: &str) -> Result<Option<Response>, StoreError>;

    /// Store an entry, creating the store if needed and overwriting any
    /// previous entry under the same key.
    async fn put(&self, name: &str, key: &str, response: &Response) -> Result<(), StoreError>;

    /// Keys held by a store, sorted. A missing store has none.
    async fn entries(&self, name: &str) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn ensure_cacheable(key: &str, response: &Response) -> Result<(), StoreError> {
    if response.ok() {
        Ok(())
    } else {
        Err(StoreError::NotCacheable {
            key: key.to_string(),
            status: response.status,
        })
    }
}
