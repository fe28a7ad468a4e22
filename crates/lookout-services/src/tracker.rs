//! Tracker: remembers which transactions and blocks were already seen.

use lookout_core::{Hash256, InvVector};

use crate::dedup::DedupMap;

/// Two dedup maps, one per content kind.
pub struct Tracker {
    transactions: DedupMap,
    blocks: DedupMap,
}

impl Tracker {
    pub fn new(shards: usize) -> Self {
        Self {
            transactions: DedupMap::with_shards(shards),
            blocks: DedupMap::with_shards(shards),
        }
    }

    /// Record a transaction id. Returns true the first time it is seen.
    pub fn observe_tx(&self, txid: &Hash256) -> bool {
        self.transactions.insert(&txid.to_string())
    }

    pub fn knows_tx(&self, txid: &Hash256) -> bool {
        self.transactions.has(&txid.to_string())
    }

    pub fn forget_tx(&self, txid: &Hash256) -> bool {
        self.transactions.remove(&txid.to_string())
    }

    /// Record a block hash. Returns true the first time it is seen.
    pub fn observe_block(&self, hash: &Hash256) -> bool {
        self.blocks.insert(&hash.to_string())
    }

    pub fn knows_block(&self, hash: &Hash256) -> bool {
        self.blocks.has(&hash.to_string())
    }

    pub fn forget_block(&self, hash: &Hash256) -> bool {
        self.blocks.remove(&hash.to_string())
    }

    /// Route an inventory entry to the matching map.
    ///
    /// Returns true if the entry is new. Entries that are neither
    /// transactions nor blocks are never tracked and always count as new.
    pub fn observe_inventory(&self, item: &InvVector) -> bool {
        if item.is_tx() {
            self.observe_tx(&item.hash)
        } else if item.is_block() {
            self.observe_block(&item.hash)
        } else {
            true
        }
    }

    /// (transactions, blocks) currently tracked.
    pub fn counts(&self) -> (usize, usize) {
        (self.transactions.len(), self.blocks.len())
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(crate::dedup::DEFAULT_SHARDS)
    }
}
