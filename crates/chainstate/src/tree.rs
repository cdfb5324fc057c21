//! Hash-keyed arena of block index entries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use ember_consensus::{hash_is_null, Hash256};
use ember_primitives::block::BlockHeader;
use ember_primitives::hash::hash_to_hex;

use crate::blockindex::{BlockIndexEntry, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK, BLOCK_FAILED_VALID};
use crate::trust::block_trust;

/// Timestamps sampled for the median-time-past window.
pub const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    MissingPredecessor(Hash256),
    SecondGenesis(Hash256),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::MissingPredecessor(hash) => {
                write!(f, "predecessor {} not in block index", hash_to_hex(hash))
            }
            TreeError::SecondGenesis(hash) => {
                write!(f, "{} claims to be a second genesis", hash_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for TreeError {}

/// The block tree. Entries are owned by a hash-keyed arena and reference
/// each other by hash, so the graph carries no ownership cycles. Entries
/// are never removed for the life of the process.
#[derive(Debug, Default)]
pub struct BlockTree {
    entries: HashMap<Hash256, BlockIndexEntry>,
    genesis: Option<Hash256>,
    next_sequence: u64,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn genesis_hash(&self) -> Option<Hash256> {
        self.genesis
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BlockIndexEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockIndexEntry> {
        self.entries.values()
    }

    /// Insert a newly observed header. Idempotent: re-observing a known
    /// header returns its hash without touching the entry.
    pub fn insert_header(&mut self, header: &BlockHeader) -> Result<Hash256, TreeError> {
        let hash = header.hash();
        if self.entries.contains_key(&hash) {
            return Ok(hash);
        }
        let entry = BlockIndexEntry::from_header(hash, header);
        self.link_and_insert(entry, header.prev_block)
    }

    /// Link an entry into the tree: resolve the predecessor, derive height
    /// and cumulative trust, build the skip pointer, and assign the receive
    /// sequence. The predecessor must already be present.
    pub(crate) fn link_and_insert(
        &mut self,
        mut entry: BlockIndexEntry,
        prev_block: Hash256,
    ) -> Result<Hash256, TreeError> {
        let hash = entry.hash;
        entry.prev = if hash_is_null(&prev_block) {
            None
        } else {
            Some(prev_block)
        };

        match entry.prev {
            None => {
                if let Some(existing) = self.genesis {
                    if existing != hash {
                        return Err(TreeError::SecondGenesis(hash));
                    }
                }
                entry.height = 0;
                entry.chain_trust = block_trust(entry.bits);
            }
            Some(prev_hash) => {
                let parent = self
                    .entries
                    .get(&prev_hash)
                    .ok_or(TreeError::MissingPredecessor(prev_hash))?;
                entry.height = parent.height + 1;
                entry.chain_trust = parent.chain_trust + block_trust(entry.bits);
            }
        }

        entry.sequence_id = self.next_sequence;
        self.next_sequence += 1;

        entry.skip = if entry.height > 0 {
            let prev_hash = entry.prev.expect("non-genesis entry has a predecessor");
            self.ancestor_hash(&prev_hash, skip_height(entry.height))
        } else {
            None
        };

        if entry.prev.is_none() {
            self.genesis = Some(hash);
        }
        self.entries.insert(hash, entry);
        Ok(hash)
    }

    /// The entry at `height` on the path from genesis to `hash`, or `None`
    /// if the height is out of range. Walks skip pointers where they do not
    /// overshoot, so the traversal is logarithmic in the height difference.
    pub fn ancestor_hash(&self, hash: &Hash256, height: i32) -> Option<Hash256> {
        let entry = self.entries.get(hash)?;
        if height < 0 || height > entry.height {
            return None;
        }

        let mut walk = entry;
        let mut height_walk = entry.height;
        while height_walk > height {
            let height_skip = skip_height(height_walk);
            let height_skip_prev = skip_height(height_walk - 1);
            let next = match walk.skip {
                // Prefer the skip link when it lands on the target, or when
                // it stays above the target and the predecessor's own skip
                // would not land materially closer.
                Some(skip)
                    if height_skip == height
                        || (height_skip > height
                            && !(height_skip_prev < height_skip - 2
                                && height_skip_prev >= height)) =>
                {
                    height_walk = height_skip;
                    skip
                }
                _ => {
                    height_walk -= 1;
                    walk.prev?
                }
            };
            walk = self.entries.get(&next)?;
        }
        Some(walk.hash)
    }

    pub fn ancestor(&self, hash: &Hash256, height: i32) -> Option<&BlockIndexEntry> {
        let ancestor = self.ancestor_hash(hash, height)?;
        self.entries.get(&ancestor)
    }

    /// Median timestamp over this block and up to ten ancestors. The
    /// lower-middle element is taken for even sample counts.
    pub fn median_time_past(&self, hash: &Hash256) -> Option<i64> {
        let mut times: Vec<i64> = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = self.entries.get(hash)?;
        loop {
            times.push(cursor.block_time());
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            match cursor.prev {
                Some(prev) => cursor = self.entries.get(&prev)?,
                None => break,
            }
        }
        times.sort_unstable();
        Some(times[times.len() / 2])
    }

    /// Recompute the cumulative transaction count for `hash` from its
    /// predecessor. Stays zero while any ancestor's transactions are
    /// missing.
    pub fn update_chain_tx(&mut self, hash: &Hash256) {
        let Some(entry) = self.entries.get(hash) else {
            return;
        };
        if entry.tx_count == 0 {
            return;
        }
        let parent_total = match entry.prev {
            None => Some(0u64),
            Some(prev) => match self.entries.get(&prev) {
                Some(parent) if parent.chain_tx_count > 0 => Some(parent.chain_tx_count),
                _ => None,
            },
        };
        if let Some(parent_total) = parent_total {
            let total = parent_total + u64::from(entry.tx_count);
            if let Some(entry) = self.entries.get_mut(hash) {
                entry.chain_tx_count = total;
            }
        }
    }

    /// Mark a block invalid and flag every current descendant. Future
    /// descendants are flagged by `link_and_insert` callers re-running this
    /// after observing a failed predecessor, or by the validation driver.
    pub fn mark_failed(&mut self, hash: &Hash256) -> bool {
        let Some(entry) = self.entries.get_mut(hash) else {
            return false;
        };
        entry.status |= BLOCK_FAILED_VALID;
        ember_log::log_warn!(
            "marking block {} invalid at height {}",
            hash_to_hex(hash),
            entry.height
        );
        self.propagate_failures();
        true
    }

    /// Sweep the tree in height order, setting `FAILED_CHILD` on every
    /// entry whose predecessor carries a failure flag. A single ascending
    /// pass reaches a fixpoint because parents precede children.
    pub fn propagate_failures(&mut self) {
        let mut order: Vec<(i32, Hash256)> = self
            .entries
            .values()
            .map(|entry| (entry.height, entry.hash))
            .collect();
        order.sort_unstable();

        for (_, hash) in order {
            let Some(entry) = self.entries.get(&hash) else {
                continue;
            };
            let Some(prev) = entry.prev else {
                continue;
            };
            let parent_failed = self
                .entries
                .get(&prev)
                .is_some_and(|parent| parent.status & BLOCK_FAILED_MASK != 0);
            if parent_failed {
                if let Some(entry) = self.entries.get_mut(&hash) {
                    entry.status |= BLOCK_FAILED_CHILD;
                }
            }
        }
    }

    /// The most-work tip candidate that has not failed, preferring the
    /// first-received entry among equal-trust competitors.
    pub fn best_candidate(&self) -> Option<&BlockIndexEntry> {
        self.entries
            .values()
            .filter(|entry| entry.status & BLOCK_FAILED_MASK == 0)
            .max_by(|a, b| cmp_tip_preference(a, b))
    }
}

/// Best-chain ordering: higher cumulative trust wins; ties go to the entry
/// received first.
pub fn cmp_tip_preference(a: &BlockIndexEntry, b: &BlockIndexEntry) -> Ordering {
    a.chain_trust
        .cmp(&b.chain_trust)
        .then_with(|| b.sequence_id.cmp(&a.sequence_id))
}

fn invert_lowest_one(value: i32) -> i32 {
    value & (value - 1)
}

/// Deterministic skip-list height: roughly square-root spacing, denser near
/// the tip.
pub(crate) fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockindex::ValidityStage;
    use ember_consensus::NULL_HASH;

    fn header(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 7,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 0x1e0fffff,
            nonce,
        }
    }

    fn extend(tree: &mut BlockTree, prev: Hash256, time: u32, nonce: u32) -> Hash256 {
        tree.insert_header(&header(prev, time, nonce)).unwrap()
    }

    fn chain(tree: &mut BlockTree, len: usize) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(len);
        let mut prev = NULL_HASH;
        for i in 0..len {
            let hash = extend(tree, prev, 1000 + i as u32 * 60, i as u32);
            hashes.push(hash);
            prev = hash;
        }
        hashes
    }

    #[test]
    fn skip_height_known_values() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        assert_eq!(skip_height(2), 0);
        assert_eq!(skip_height(16), 0);
        assert_eq!(skip_height(12), 8);
        assert_eq!(skip_height(13), 1);
        for height in 2..1000 {
            let skip = skip_height(height);
            assert!(skip >= 0 && skip < height, "height {height} -> {skip}");
        }
    }

    #[test]
    fn insert_links_heights_and_trust() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 5);
        for (height, hash) in hashes.iter().enumerate() {
            let entry = tree.get(hash).unwrap();
            assert_eq!(entry.height, height as i32);
        }
        let genesis = tree.get(&hashes[0]).unwrap();
        let tip = tree.get(&hashes[4]).unwrap();
        assert!(tip.chain_trust > genesis.chain_trust);
        assert_eq!(tree.genesis_hash(), Some(hashes[0]));
    }

    #[test]
    fn insert_requires_known_predecessor() {
        let mut tree = BlockTree::new();
        let orphan = header([9u8; 32], 1000, 0);
        assert_eq!(
            tree.insert_header(&orphan),
            Err(TreeError::MissingPredecessor([9u8; 32]))
        );
    }

    #[test]
    fn rejects_second_genesis() {
        let mut tree = BlockTree::new();
        chain(&mut tree, 1);
        let rival = header(NULL_HASH, 9999, 77);
        assert!(matches!(
            tree.insert_header(&rival),
            Err(TreeError::SecondGenesis(_))
        ));
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut tree = BlockTree::new();
        let first = header(NULL_HASH, 1000, 0);
        let hash = tree.insert_header(&first).unwrap();
        let sequence = tree.get(&hash).unwrap().sequence_id;
        assert_eq!(tree.insert_header(&first).unwrap(), hash);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&hash).unwrap().sequence_id, sequence);
    }

    #[test]
    fn median_time_of_genesis_is_its_timestamp() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 1);
        assert_eq!(tree.median_time_past(&hashes[0]), Some(1000));
    }

    #[test]
    fn median_time_of_full_window() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 12);
        // Window over heights 1..=11: times 1060, 1120, ..., 1660; the
        // sorted middle (index 5) is 1360.
        assert_eq!(tree.median_time_past(&hashes[11]), Some(1360));
        // Window over heights 0..=3: even count takes the lower middle.
        assert_eq!(tree.median_time_past(&hashes[3]), Some(1120));
    }

    #[test]
    fn failure_propagates_to_descendants() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 6);
        // Side branch from height 2 stays unaffected.
        let side = extend(&mut tree, hashes[2], 5000, 99);

        for hash in &hashes {
            tree.get_mut(hash).unwrap().raise_validity(ValidityStage::Tree);
        }
        assert!(tree.mark_failed(&hashes[3]));

        for hash in &hashes[..3] {
            assert!(tree.get(hash).unwrap().is_valid(ValidityStage::Header));
        }
        for hash in &hashes[3..] {
            assert!(!tree.get(hash).unwrap().is_valid(ValidityStage::Header));
        }
        let side_entry = tree.get(&side).unwrap();
        assert_eq!(side_entry.status & BLOCK_FAILED_MASK, 0);
    }

    #[test]
    fn best_candidate_skips_failed_and_breaks_ties_by_arrival() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 3);
        // Two rivals at the same height with identical bits: equal trust.
        let first_seen = extend(&mut tree, hashes[2], 7000, 1);
        let second_seen = extend(&mut tree, hashes[2], 7000, 2);
        assert_ne!(first_seen, second_seen);

        assert_eq!(tree.best_candidate().unwrap().hash, first_seen);

        tree.mark_failed(&first_seen);
        assert_eq!(tree.best_candidate().unwrap().hash, second_seen);
    }

    #[test]
    fn chain_tx_requires_contiguous_data() {
        let mut tree = BlockTree::new();
        let hashes = chain(&mut tree, 3);
        tree.get_mut(&hashes[0]).unwrap().tx_count = 1;
        tree.update_chain_tx(&hashes[0]);
        assert_eq!(tree.get(&hashes[0]).unwrap().chain_tx_count, 1);

        // Height 2 has data but height 1 does not: stays zero.
        tree.get_mut(&hashes[2]).unwrap().tx_count = 4;
        tree.update_chain_tx(&hashes[2]);
        assert_eq!(tree.get(&hashes[2]).unwrap().chain_tx_count, 0);

        tree.get_mut(&hashes[1]).unwrap().tx_count = 2;
        tree.update_chain_tx(&hashes[1]);
        tree.update_chain_tx(&hashes[2]);
        assert_eq!(tree.get(&hashes[1]).unwrap().chain_tx_count, 3);
        assert_eq!(tree.get(&hashes[2]).unwrap().chain_tx_count, 7);
    }
}
