//! Default `ByteStore` backing: an in-memory, sharded LRU with a hard byte
//! cap and TTL expiration.
//!
//! Grounded in the bootstrap sharding rule from the original query cache
//! (`createCacheStore`): start from 1024 shards and halve until each shard
//! would hold at least 5 MiB, with a floor of 2 shards.

use crate::error::{StoreError, StoreKind};
use crate::store::ByteStore;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

const MIN_SHARD_SIZE_MB: usize = 5;
const MIN_SHARDS: usize = 2;
const INITIAL_SHARDS: usize = 1024;

/// Default overall TTL cap applied when a caller doesn't specify one,
/// matching the spec's `24h` default.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    bytes: Vec<u8>,
    expires_at: Instant,
    tags: Vec<String>,
    size: usize,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct Shard {
    /// Recency order is tracked by the cache itself; `get` promotes, `pop_lru`
    /// evicts the least-recently-used entry. Unbounded by item count — the
    /// `byte_cap`/`bytes_used` pair below is the real eviction trigger.
    entries: LruCache<String, Entry>,
    byte_cap: usize,
    bytes_used: usize,
}

impl Shard {
    fn new(byte_cap: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            byte_cap,
            bytes_used: 0,
        }
    }

    /// `true` if a single entry of `size` bytes could ever fit, even with
    /// every other entry in the shard evicted.
    fn fits(&self, size: usize) -> bool {
        size <= self.byte_cap
    }

    fn insert(&mut self, key: String, entry: Entry) {
        if let Some(old) = self.entries.pop(&key) {
            self.bytes_used = self.bytes_used.saturating_sub(old.size);
        }
        self.bytes_used += entry.size;
        self.entries.put(key, entry);

        while self.bytes_used > self.byte_cap {
            let Some((oldest_key, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes_used = self.bytes_used.saturating_sub(evicted.size);
            trace!(key = %oldest_key, "evicted entry to satisfy shard byte cap");
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.pop(key)?;
        self.bytes_used = self.bytes_used.saturating_sub(entry.size);
        Some(entry)
    }
}

/// In-memory sharded LRU store with a hard byte cap and per-entry TTL.
pub struct ShardedMemoryStore {
    shards: Vec<Mutex<Shard>>,
    /// Tag -> set of keys, for `invalidate_by_tag`. Kept separate from the
    /// shards so a tag invalidation never needs to hold more than one
    /// shard lock at a time.
    tag_index: Mutex<std::collections::HashMap<String, HashSet<(usize, String)>>>,
    max_ttl: Duration,
}

impl ShardedMemoryStore {
    /// Build a store capped at `max_size_mb` total, with entries expiring
    /// after `max_ttl` at the latest (a `set` asking for a longer TTL is
    /// clamped to this).
    #[must_use]
    pub fn new(max_size_mb: usize, max_ttl: Duration) -> Self {
        let shard_count = Self::bootstrap_shard_count(max_size_mb);
        let byte_cap_per_shard = (max_size_mb * 1024 * 1024) / shard_count;
        debug!(
            max_size_mb,
            shard_count, byte_cap_per_shard, "created ShardedMemoryStore"
        );
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(byte_cap_per_shard)))
            .collect();
        Self {
            shards,
            tag_index: Mutex::new(std::collections::HashMap::new()),
            max_ttl,
        }
    }

    /// Build a store using the spec's default: 24h max TTL.
    #[must_use]
    pub fn with_default_ttl(max_size_mb: usize) -> Self {
        Self::new(max_size_mb, DEFAULT_MAX_TTL)
    }

    /// Choose a shard count so each shard is guaranteed at least 5 MiB,
    /// starting from 1024 and halving, with a floor of 2.
    fn bootstrap_shard_count(max_size_mb: usize) -> usize {
        let mut shards = INITIAL_SHARDS;
        while max_size_mb / shards.max(1) < MIN_SHARD_SIZE_MB {
            if shards == MIN_SHARDS {
                break;
            }
            shards /= 2;
            if shards < MIN_SHARDS {
                shards = MIN_SHARDS;
                break;
            }
        }
        shards
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }
}

#[async_trait]
impl ByteStore for ShardedMemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock().await;
        let expired = shard.entries.peek(key).is_some_and(Entry::is_expired);
        if expired {
            shard.remove(key);
            return Err(StoreError::Miss(key.to_string()));
        }
        // `get` (rather than `peek`) promotes the entry to most-recently-used.
        match shard.entries.get(key) {
            Some(entry) => Ok(entry.bytes.clone()),
            None => Err(StoreError::Miss(key.to_string())),
        }
    }

    async fn set(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Duration,
        tags: Vec<String>,
    ) -> Result<(), StoreError> {
        let effective_ttl = ttl.min(self.max_ttl);
        let size = bytes.len();
        let idx = self.shard_index(key);
        {
            let mut shard = self.shards[idx].lock().await;
            if !shard.fits(size) {
                return Err(StoreError::CapacityExceeded {
                    key: key.to_string(),
                    kind: StoreKind::classify(key),
                    reason: format!(
                        "entry of {size} bytes exceeds this shard's {} byte cap",
                        shard.byte_cap
                    ),
                });
            }
            let entry = Entry {
                bytes,
                expires_at: Instant::now() + effective_ttl,
                tags: tags.clone(),
                size,
            };
            shard.insert(key.to_string(), entry);
        }
        if !tags.is_empty() {
            let mut tag_index = self.tag_index.lock().await;
            for tag in tags {
                tag_index
                    .entry(tag)
                    .or_default()
                    .insert((idx, key.to_string()));
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let idx = self.shard_index(key);
        let removed = {
            let mut shard = self.shards[idx].lock().await;
            shard.remove(key)
        };
        if let Some(entry) = removed {
            let mut tag_index = self.tag_index.lock().await;
            for tag in &entry.tags {
                if let Some(keys) = tag_index.get_mut(tag) {
                    keys.remove(&(idx, key.to_string()));
                    if keys.is_empty() {
                        tag_index.remove(tag);
                    }
                }
            }
        }
        Ok(())
    }

    async fn invalidate_by_tag(&self, tag: &str) -> Result<(), StoreError> {
        let keys = {
            let mut tag_index = self.tag_index.lock().await;
            tag_index.remove(tag).unwrap_or_default()
        };
        let count = keys.len();
        for (idx, key) in keys {
            let mut shard = self.shards[idx].lock().await;
            shard.remove(&key);
        }
        debug!(tag, count, "invalidated entries by tag");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_shard_count_respects_floor_and_minimum_size() {
        assert_eq!(ShardedMemoryStore::bootstrap_shard_count(1024 * 8), 1024);
        // Small caps should still leave each shard >= 5 MiB, down to the
        // floor of 2 shards.
        let shards = ShardedMemoryStore::bootstrap_shard_count(16);
        assert!(shards >= MIN_SHARDS);
        assert!(16 / shards >= MIN_SHARD_SIZE_MB || shards == MIN_SHARDS);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = ShardedMemoryStore::with_default_ttl(32);
        store
            .set("k1", vec![1, 2, 3], Duration::from_secs(60), vec![])
            .await
            .unwrap();
        assert_eq!(store.get("k1").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let store = ShardedMemoryStore::with_default_ttl(32);
        assert!(store.get("missing").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected_with_capacity_exceeded() {
        // Smallest possible store: 2 shards (the floor), 1 MiB total, so
        // each shard's byte cap is well under 1 MiB — no amount of eviction
        // could ever admit a multi-megabyte entry.
        let store = ShardedMemoryStore::with_default_ttl(1);
        let oversized = vec![0u8; 2 * 1024 * 1024];
        let err = store
            .set("index__aws_ec2", oversized, Duration::from_secs(60), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CapacityExceeded {
                kind: StoreKind::IndexBucket,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let store = ShardedMemoryStore::new(32, Duration::from_millis(1));
        store
            .set("k1", vec![1], Duration::from_millis(1), vec![])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k1").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = ShardedMemoryStore::with_default_ttl(32);
        store
            .set("k1", vec![1], Duration::from_secs(60), vec![])
            .await
            .unwrap();
        store.delete("k1").await.unwrap();
        assert!(store.get("k1").await.unwrap_err().is_miss());
    }

    #[tokio::test]
    async fn invalidate_by_tag_removes_only_tagged_keys() {
        let store = ShardedMemoryStore::with_default_ttl(32);
        store
            .set(
                "k1",
                vec![1],
                Duration::from_secs(60),
                vec!["conn-a".to_string()],
            )
            .await
            .unwrap();
        store
            .set(
                "k2",
                vec![2],
                Duration::from_secs(60),
                vec!["conn-b".to_string()],
            )
            .await
            .unwrap();

        store.invalidate_by_tag("conn-a").await.unwrap();

        assert!(store.get("k1").await.unwrap_err().is_miss());
        assert_eq!(store.get("k2").await.unwrap(), vec![2]);
    }
}
