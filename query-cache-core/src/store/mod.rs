//! The backing byte store contract, and a thin adapter that layers
//! connection-tagging on top of it.
//!
//! `ByteStore` is the extension point described in spec §4.3: anything
//! implementing `get`/`set`/`delete`/`invalidate_by_tag` can back a
//! `QueryCache`. [`memory::ShardedMemoryStore`] is the one implementation
//! this crate ships, so the crate is runnable standalone.

pub mod memory;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::ShardedMemoryStore;

/// An LRU/TTL blob store: `get(key) -> bytes`, `set(key, bytes, ttl, tags)`,
/// `delete(key)`, `invalidate_by_tag(tag)`.
///
/// Implementations must be safe for concurrent use from multiple tasks —
/// this is the only shared external resource `QueryCache` depends on.
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Fetch the bytes stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Miss` if the key is absent or expired; any
    /// other variant indicates a genuine store failure.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Store `bytes` under `key`, expiring after `ttl` and tagged with
    /// `tags` for later `invalidate_by_tag` calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write (e.g. capacity).
    async fn set(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Duration,
        tags: Vec<String>,
    ) -> Result<(), StoreError>;

    /// Remove `key`, if present. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only on genuine store failure.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key tagged with `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error only on genuine store failure.
    async fn invalidate_by_tag(&self, tag: &str) -> Result<(), StoreError>;
}

/// Thin wrapper over a [`ByteStore`] that guarantees every write carries the
/// request's connection name as a tag, so `ClearForConnection` can issue a
/// single tag invalidation that reaches both index buckets and pages.
pub struct StoreAdapter<S> {
    store: S,
}

impl<S: ByteStore> StoreAdapter<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Fetch bytes for `key`.
    ///
    /// # Errors
    ///
    /// See [`ByteStore::get`].
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.store.get(key).await
    }

    /// Store `bytes` under `key`, ensuring `connection_name` is present in
    /// the tag set regardless of what the caller passed.
    ///
    /// # Errors
    ///
    /// See [`ByteStore::set`].
    pub async fn set(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Duration,
        connection_name: &str,
        mut tags: Vec<String>,
    ) -> Result<(), StoreError> {
        if !tags.iter().any(|t| t == connection_name) {
            tags.push(connection_name.to_string());
        }
        self.store.set(key, bytes, ttl, tags).await
    }

    /// Remove `key`.
    ///
    /// # Errors
    ///
    /// See [`ByteStore::delete`].
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    /// Invalidate every entry tagged with `connection_name`. Used by
    /// `ClearForConnection`.
    ///
    /// # Errors
    ///
    /// See [`ByteStore::invalidate_by_tag`].
    pub async fn invalidate_by_tag(&self, connection_name: &str) -> Result<(), StoreError> {
        self.store.invalidate_by_tag(connection_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn set_always_includes_connection_tag() {
        let adapter = StoreAdapter::new(ShardedMemoryStore::new(16, Duration::from_secs(3600)));
        adapter
            .set("k", vec![1, 2, 3], Duration::from_secs(60), "aws", vec![])
            .await
            .unwrap();
        // connection-tag invalidation must reach this key even though no
        // explicit tag was passed in.
        adapter.invalidate_by_tag("aws").await.unwrap();
        assert!(adapter.get("k").await.unwrap_err().is_miss());
    }
}
