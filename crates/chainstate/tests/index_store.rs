//! Persisting the block index and rebuilding the tree from cold storage.

use std::sync::Arc;

use ember_chainstate::blockindex::StakeState;
use ember_chainstate::clock::FixedTimeSource;
use ember_chainstate::diskindex::HASH_CACHE_MIN_AGE;
use ember_chainstate::flatfiles::BlockFileStore;
use ember_chainstate::store::{BlockIndexStore, BlockIndexStoreConfig, IndexStoreError};
use ember_chainstate::tree::BlockTree;
use ember_consensus::{Hash256, NULL_HASH};
use ember_primitives::block::BlockHeader;
use ember_storage::memory::MemoryStore;
use ember_storage::WriteBatch;

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

/// A tree of 50 main-branch blocks plus a short fork, stake detail resolved
/// for every entry.
fn populated_tree() -> (BlockTree, Vec<Hash256>) {
    let mut tree = BlockTree::new();
    let mut hashes = Vec::new();
    let mut prev = NULL_HASH;
    for i in 0..50u32 {
        let hash = tree.insert_header(&header(prev, 1_000_000 + i * 60, i)).unwrap();
        hashes.push(hash);
        prev = hash;
    }
    let fork = tree
        .insert_header(&header(hashes[30], 1_500_000, 999))
        .unwrap();
    hashes.push(fork);
    for hash in &hashes {
        let entry = tree.get_mut(hash).unwrap();
        entry.stake = StakeState::ProofOfWork;
        entry.tx_count = 1;
    }
    for hash in &hashes {
        tree.update_chain_tx(hash);
    }
    (tree, hashes)
}

fn persist(tree: &BlockTree, hashes: &[Hash256], best: &Hash256) -> BlockIndexStore<MemoryStore> {
    let store = BlockIndexStore::new(
        Arc::new(MemoryStore::new()),
        BlockIndexStoreConfig::default(),
    );
    let mut batch = WriteBatch::new();
    for hash in hashes {
        store.put_entry(&mut batch, tree.get(hash).unwrap());
    }
    store.set_best(&mut batch, best);
    store.write_batch(&batch).unwrap();
    store
}

#[test]
fn reload_rebuilds_the_tree() {
    let (tree, hashes) = populated_tree();
    let tip = hashes[49];
    let store = persist(&tree, &hashes, &tip);

    let clock = FixedTimeSource(1_000_000 + 2 * HASH_CACHE_MIN_AGE);
    let reloaded = store.load_tree(&clock).unwrap();

    assert_eq!(reloaded.len(), tree.len());
    assert_eq!(reloaded.genesis_hash(), tree.genesis_hash());
    assert_eq!(store.best_hash().unwrap(), Some(tip));
    assert!(store.record(&tip).unwrap().is_some());
    assert!(store.record(&[0x77; 32]).unwrap().is_none());

    for hash in &hashes {
        let original = tree.get(hash).unwrap();
        let loaded = reloaded.get(hash).unwrap();
        assert_eq!(loaded.height, original.height);
        assert_eq!(loaded.prev, original.prev);
        assert_eq!(loaded.skip, original.skip);
        assert_eq!(loaded.chain_trust, original.chain_trust);
        assert_eq!(loaded.chain_tx_count, original.chain_tx_count);
        assert_eq!(loaded.status, original.status);
        assert_eq!(loaded.stake, original.stake);
    }
}

#[test]
fn reload_works_without_the_fast_hash_path() {
    let (tree, hashes) = populated_tree();
    let store = BlockIndexStore::new(
        Arc::new(MemoryStore::new()),
        BlockIndexStoreConfig {
            fast_hash_cache: false,
        },
    );
    let mut batch = WriteBatch::new();
    for hash in &hashes {
        store.put_entry(&mut batch, tree.get(hash).unwrap());
    }
    store.write_batch(&batch).unwrap();

    let reloaded = store.load_tree(&FixedTimeSource(0)).unwrap();
    assert_eq!(reloaded.len(), tree.len());
}

#[test]
fn reload_detects_a_mismatched_key() {
    let (tree, hashes) = populated_tree();
    let backing = Arc::new(MemoryStore::new());
    let store = BlockIndexStore::new(backing.clone(), BlockIndexStoreConfig::default());

    let mut batch = WriteBatch::new();
    for hash in &hashes {
        store.put_entry(&mut batch, tree.get(hash).unwrap());
    }
    // File one record under the wrong hash.
    let entry = tree.get(&hashes[10]).unwrap();
    let record = ember_chainstate::diskindex::DiskBlockIndex::from_entry(entry);
    batch.put(ember_storage::Column::BlockIndex, [0xee; 32], record.encode());
    store.write_batch(&batch).unwrap();

    // Recomputation catches the bogus key regardless of the cache policy.
    let err = store.load_tree(&FixedTimeSource(0)).unwrap_err();
    assert!(matches!(err, IndexStoreError::Corrupt(_)));
}

#[test]
fn best_hash_is_absent_on_a_fresh_store() {
    let store = BlockIndexStore::new(
        Arc::new(MemoryStore::new()),
        BlockIndexStoreConfig::default(),
    );
    assert_eq!(store.best_hash().unwrap(), None);
    assert!(store.load_tree(&FixedTimeSource(0)).unwrap().is_empty());
}

#[test]
fn flat_files_round_trip_and_roll_over() {
    let dir = tempfile::tempdir().unwrap();
    let files = BlockFileStore::with_prefix(dir.path(), "blk", 64).unwrap();

    let first = files.append(&[1u8; 20]).unwrap();
    let second = files.append(&[2u8; 20]).unwrap();
    assert_eq!(first.file, 0);
    assert_eq!(second.file, 0);
    assert_eq!(second.offset, 24);

    // 24 more bytes would exceed the 64-byte cap, so the store rolls.
    let third = files.append(&[3u8; 20]).unwrap();
    assert_eq!(third.file, 1);
    assert_eq!(third.offset, 0);

    assert_eq!(files.read(first).unwrap(), vec![1u8; 20]);
    assert_eq!(files.read(second).unwrap(), vec![2u8; 20]);
    assert_eq!(files.read(third).unwrap(), vec![3u8; 20]);
}

#[test]
fn flat_file_store_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let first;
    {
        let files = BlockFileStore::with_prefix(dir.path(), "blk", 1024).unwrap();
        first = files.append(&[7u8; 10]).unwrap();
    }
    let files = BlockFileStore::with_prefix(dir.path(), "blk", 1024).unwrap();
    let second = files.append(&[8u8; 10]).unwrap();
    assert_eq!(second.file, first.file);
    assert_eq!(second.offset, 14);
    assert_eq!(files.read(first).unwrap(), vec![7u8; 10]);
    assert_eq!(files.read(second).unwrap(), vec![8u8; 10]);
}
