//! Sharded concurrent set for suppressing already-seen content.
//!
//! Keys are spread over a fixed array of shards by a stable hash of the
//! key, and every shard carries its own read/write lock. Operations lock
//! exactly one shard for the duration of a single insert/has/remove, so
//! callers on different shards never contend.

use std::collections::HashSet;

use parking_lot::RwLock;

pub const DEFAULT_SHARDS: usize = 32;

/// A set of seen identifiers, safe to share between many sessions.
pub struct DedupMap {
    shards: Box<[RwLock<HashSet<String>>]>,
}

impl DedupMap {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a map with `shards` buckets. Zero is treated as one.
    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashSet::new()))
            .collect();
        Self { shards }
    }

    /// Record `key`. Returns true if it was not already present.
    pub fn insert(&self, key: &str) -> bool {
        let shard = self.shard(key);
        if shard.read().contains(key) {
            return false;
        }
        shard.write().insert(key.to_owned())
    }

    pub fn has(&self, key: &str) -> bool {
        self.shard(key).read().contains(key)
    }

    /// Forget `key`. Returns true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key).write().remove(key)
    }

    /// Total entries across all shards. Not a snapshot under concurrent writes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    /// Index of the shard owning `key`. Fixed for the lifetime of the map.
    pub fn shard_index(&self, key: &str) -> usize {
        let digest = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &RwLock<HashSet<String>> {
        &self.shards[self.shard_index(key)]
    }
}

impl Default for DedupMap {
    fn default() -> Self {
        Self::new()
    }
}
