//! Skip-pointer ancestor lookups checked against a naive predecessor walk.

use ember_chainstate::tree::BlockTree;
use ember_consensus::{Hash256, NULL_HASH};
use ember_primitives::block::BlockHeader;

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

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

fn naive_ancestor(tree: &BlockTree, mut hash: Hash256, height: i32) -> Option<Hash256> {
    loop {
        let entry = tree.get(&hash)?;
        if entry.height < height {
            return None;
        }
        if entry.height == height {
            return Some(hash);
        }
        hash = entry.prev?;
    }
}

#[test]
fn ancestor_matches_naive_walk_on_long_chain() {
    let mut tree = BlockTree::new();
    let mut hashes = Vec::new();
    let mut prev = NULL_HASH;
    for i in 0..3000u32 {
        let hash = tree.insert_header(&header(prev, 1_000_000 + i * 60, i)).unwrap();
        hashes.push(hash);
        prev = hash;
    }

    let mut rng = Lcg(0x5eed_cafe);
    for _ in 0..2000 {
        let from = rng.below(hashes.len() as u64) as usize;
        let to = rng.below(from as u64 + 1) as i32;
        let fast = tree.ancestor_hash(&hashes[from], to);
        let slow = naive_ancestor(&tree, hashes[from], to);
        assert_eq!(fast, slow);
        assert_eq!(fast, Some(hashes[to as usize]));
    }
}

#[test]
fn ancestor_matches_naive_walk_with_forks() {
    let mut tree = BlockTree::new();
    let genesis = tree.insert_header(&header(NULL_HASH, 1_000_000, 0)).unwrap();
    let mut tips = vec![genesis];

    // Grow a random tree: mostly extend the newest tip, sometimes branch
    // off an older one.
    let mut rng = Lcg(0xfeed_0001);
    for i in 1..4000u32 {
        let parent = if rng.below(10) == 0 {
            tips[rng.below(tips.len() as u64) as usize]
        } else {
            *tips.last().unwrap()
        };
        let hash = tree.insert_header(&header(parent, 1_000_000 + i * 60, i)).unwrap();
        tips.push(hash);
    }

    for _ in 0..2000 {
        let from = tips[rng.below(tips.len() as u64) as usize];
        let from_height = tree.get(&from).unwrap().height;
        let to = rng.below(from_height as u64 + 1) as i32;
        assert_eq!(tree.ancestor_hash(&from, to), naive_ancestor(&tree, from, to));
    }
}

#[test]
fn ancestor_boundary_cases() {
    let mut tree = BlockTree::new();
    let mut prev = NULL_HASH;
    let mut hashes = Vec::new();
    for i in 0..100u32 {
        let hash = tree.insert_header(&header(prev, 1_000_000 + i * 60, i)).unwrap();
        hashes.push(hash);
        prev = hash;
    }

    let tip = *hashes.last().unwrap();
    assert_eq!(tree.ancestor_hash(&tip, 99), Some(tip));
    assert_eq!(tree.ancestor_hash(&tip, 0), Some(hashes[0]));
    assert_eq!(tree.ancestor_hash(&tip, 100), None);
    assert_eq!(tree.ancestor_hash(&tip, -1), None);
    assert_eq!(tree.ancestor_hash(&NULL_HASH, 0), None);
}
