//! The currently active branch as a height-indexed array.

use std::fmt;

use ember_consensus::{Hash256, NULL_HASH};
use ember_primitives::hash::hash_to_hex;

use crate::blockindex::BlockIndexEntry;
use crate::tree::BlockTree;

/// Sparse, exponentially spaced list of ancestor hashes. Lets a peer find
/// the fork point against its own chain without receiving every hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    pub fn is_empty(&self) -> bool {
        self.have.is_empty()
    }

    pub fn len(&self) -> usize {
        self.have.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    UnknownBlock(Hash256),
    BrokenLink(Hash256),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::UnknownBlock(hash) => {
                write!(f, "block {} not in index", hash_to_hex(hash))
            }
            ChainError::BrokenLink(hash) => {
                write!(f, "predecessor chain of {} is broken", hash_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// Height-indexed view over the best-known connected branch. Entry `h` of
/// the array is the active block at height `h`.
#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    hashes: Vec<Hash256>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<Hash256> {
        self.hashes.first().copied()
    }

    pub fn tip(&self) -> Option<Hash256> {
        self.hashes.last().copied()
    }

    pub fn at_height(&self, height: i32) -> Option<Hash256> {
        if height < 0 || height as usize >= self.hashes.len() {
            return None;
        }
        Some(self.hashes[height as usize])
    }

    /// Height of the tip; -1 when the chain is empty.
    pub fn height(&self) -> i32 {
        self.hashes.len() as i32 - 1
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Identity membership test: true iff this exact entry occupies its
    /// height in the active branch.
    pub fn contains(&self, entry: &BlockIndexEntry) -> bool {
        self.at_height(entry.height) == Some(entry.hash)
    }

    /// Successor of `entry` on this chain, or `None` if `entry` is off the
    /// chain or is the tip.
    pub fn next(&self, entry: &BlockIndexEntry) -> Option<Hash256> {
        if self.contains(entry) {
            self.at_height(entry.height + 1)
        } else {
            None
        }
    }

    /// Repoint the chain at a new tip, rewriting only the suffix that
    /// diverges from the current array. The walk stops as soon as it finds
    /// a height where the array already agrees.
    pub fn set_tip(&mut self, tree: &BlockTree, tip: &Hash256) -> Result<(), ChainError> {
        let mut entry = tree.get(tip).ok_or(ChainError::UnknownBlock(*tip))?;
        let tip_height = entry.height;
        self.hashes.resize((tip_height + 1) as usize, NULL_HASH);

        loop {
            let slot = entry.height as usize;
            if self.hashes[slot] == entry.hash {
                break;
            }
            self.hashes[slot] = entry.hash;
            match entry.prev {
                Some(prev) => {
                    entry = tree.get(&prev).ok_or(ChainError::BrokenLink(entry.hash))?;
                }
                None => break,
            }
        }

        ember_log::log_debug!(
            "active chain tip moved to {} at height {}",
            hash_to_hex(tip),
            tip_height
        );
        Ok(())
    }

    /// Build a locator for `from` (default: the tip). Gaps double once the
    /// locator holds more than ten hashes; genesis is always the final
    /// element.
    pub fn locator(&self, tree: &BlockTree, from: Option<Hash256>) -> BlockLocator {
        let mut have = Vec::with_capacity(32);
        let Some(start) = from.or_else(|| self.tip()) else {
            return BlockLocator { have };
        };

        let mut hash = start;
        let mut step: i32 = 1;
        loop {
            have.push(hash);
            let Some(entry) = tree.get(&hash) else {
                break;
            };
            if entry.height == 0 {
                break;
            }
            let target = (entry.height - step).max(0);
            let next = if self.contains(entry) {
                // On the active branch the array is the fastest index.
                self.at_height(target)
            } else {
                tree.ancestor_hash(&hash, target)
            };
            match next {
                Some(next) => hash = next,
                None => break,
            }
            if have.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        BlockLocator { have }
    }

    /// First locator hash present on this chain, scanning most-recent
    /// first; falls back to genesis when nothing matches.
    pub fn find_fork_by_locator(&self, tree: &BlockTree, locator: &BlockLocator) -> Option<Hash256> {
        for hash in &locator.have {
            if let Some(entry) = tree.get(hash) {
                if self.contains(entry) {
                    return Some(entry.hash);
                }
            }
        }
        self.genesis()
    }

    /// Last common block between this chain and the branch ending at
    /// `hash`. Clamps to the tip height via an ancestor jump, then walks
    /// predecessors until the branch rejoins the chain.
    pub fn find_fork(&self, tree: &BlockTree, hash: &Hash256) -> Option<Hash256> {
        let entry = tree.get(hash)?;
        let mut cursor = if entry.height > self.height() {
            tree.ancestor(hash, self.height())?
        } else {
            entry
        };
        while !self.contains(cursor) {
            let prev = cursor.prev?;
            cursor = tree.get(&prev)?;
        }
        Some(cursor.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_primitives::block::BlockHeader;

    fn extend(tree: &mut BlockTree, prev: Hash256, nonce: u32) -> Hash256 {
        let header = BlockHeader {
            version: 7,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1000 + nonce,
            bits: 0x1e0fffff,
            nonce,
        };
        tree.insert_header(&header).unwrap()
    }

    fn build_chain(tree: &mut BlockTree, from: Hash256, count: u32, tag: u32) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut prev = from;
        for i in 0..count {
            let hash = extend(tree, prev, tag + i);
            hashes.push(hash);
            prev = hash;
        }
        hashes
    }

    #[test]
    fn empty_chain() {
        let chain = ActiveChain::new();
        assert_eq!(chain.height(), -1);
        assert_eq!(chain.tip(), None);
        assert_eq!(chain.genesis(), None);
        assert_eq!(chain.at_height(0), None);
    }

    #[test]
    fn tip_and_lookup() {
        let mut tree = BlockTree::new();
        let hashes = build_chain(&mut tree, NULL_HASH, 5, 0);
        let mut chain = ActiveChain::new();
        chain.set_tip(&tree, hashes.last().unwrap()).unwrap();

        assert_eq!(chain.height(), 4);
        assert_eq!(chain.genesis(), Some(hashes[0]));
        assert_eq!(chain.tip(), Some(hashes[4]));
        for (height, hash) in hashes.iter().enumerate() {
            assert_eq!(chain.at_height(height as i32), Some(*hash));
        }
        assert_eq!(chain.at_height(5), None);
        assert_eq!(chain.at_height(-1), None);

        let entry = tree.get(&hashes[2]).unwrap();
        assert!(chain.contains(entry));
        assert_eq!(chain.next(entry), Some(hashes[3]));
        let tip_entry = tree.get(&hashes[4]).unwrap();
        assert_eq!(chain.next(tip_entry), None);
    }

    #[test]
    fn next_of_off_chain_entry_is_none() {
        let mut tree = BlockTree::new();
        let hashes = build_chain(&mut tree, NULL_HASH, 3, 0);
        let rival = extend(&mut tree, hashes[1], 900);

        let mut chain = ActiveChain::new();
        chain.set_tip(&tree, &hashes[2]).unwrap();
        let rival_entry = tree.get(&rival).unwrap();
        assert!(!chain.contains(rival_entry));
        assert_eq!(chain.next(rival_entry), None);
    }

    #[test]
    fn set_tip_shrinks_on_reorg_to_lower_tip() {
        let mut tree = BlockTree::new();
        let hashes = build_chain(&mut tree, NULL_HASH, 6, 0);
        let mut chain = ActiveChain::new();
        chain.set_tip(&tree, &hashes[5]).unwrap();
        chain.set_tip(&tree, &hashes[2]).unwrap();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip(), Some(hashes[2]));
    }

    #[test]
    fn set_tip_unknown_block() {
        let tree = BlockTree::new();
        let mut chain = ActiveChain::new();
        assert_eq!(
            chain.set_tip(&tree, &[5u8; 32]),
            Err(ChainError::UnknownBlock([5u8; 32]))
        );
    }
}
