//! Block Key Index
//!
//! Key → block chain map persisted to a side key file.

use std::collections::HashSet;

use crate::index::KeyIndex;

use super::{BlockChain, BlockStore};

/// Key index over a [`BlockStore`]
pub type BlockKeyIndex = KeyIndex<BlockChain>;

impl KeyIndex<BlockChain> {
    /// Drop entries the block file cannot back
    ///
    /// An entry is dropped when a block lies past the end of the file, when
    /// its recorded length does not fit its chain, or when it shares a block
    /// with an entry that was inserted earlier.
    pub fn drop_inconsistent(&self, store: &BlockStore) -> usize {
        let mut claimed: HashSet<u32> = HashSet::new();

        // Walk oldest first so the earliest claimant of a block wins
        let mut bad = HashSet::new();
        for (key, chain) in self.entries() {
            let overlaps = chain.blocks.iter().any(|b| claimed.contains(b));
            if overlaps || !store.chain_is_consistent(&chain) {
                bad.insert(key);
                continue;
            }
            claimed.extend(chain.blocks.iter().copied());
        }

        if bad.is_empty() {
            return 0;
        }

        let dropped = self.retain(|key, _| !bad.contains(key));
        tracing::warn!(
            "Dropped {} key index entries inconsistent with {}",
            dropped.len(),
            store.path().display()
        );
        dropped.len()
    }
}
