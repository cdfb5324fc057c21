//! Persistence of the block index over a key-value store.
//!
//! Records are keyed by block hash. Derived state (heights, chain trust,
//! skip pointers, receive order) is recomputed during reload rather than
//! persisted.

use std::fmt;
use std::sync::Arc;

use ember_consensus::Hash256;
use ember_primitives::encoding::DecodeError;
use ember_primitives::hash::hash_to_hex;
use ember_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::BlockIndexEntry;
use crate::clock::TimeSource;
use crate::diskindex::DiskBlockIndex;
use crate::tree::{BlockTree, TreeError};

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Debug)]
pub enum IndexStoreError {
    Store(StoreError),
    Decode(DecodeError),
    Tree(TreeError),
    Corrupt(&'static str),
}

impl fmt::Display for IndexStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexStoreError::Store(err) => write!(f, "{err}"),
            IndexStoreError::Decode(err) => write!(f, "{err}"),
            IndexStoreError::Tree(err) => write!(f, "{err}"),
            IndexStoreError::Corrupt(message) => write!(f, "corrupt block index: {message}"),
        }
    }
}

impl std::error::Error for IndexStoreError {}

impl From<StoreError> for IndexStoreError {
    fn from(err: StoreError) -> Self {
        IndexStoreError::Store(err)
    }
}

impl From<DecodeError> for IndexStoreError {
    fn from(err: DecodeError) -> Self {
        IndexStoreError::Decode(err)
    }
}

impl From<TreeError> for IndexStoreError {
    fn from(err: TreeError) -> Self {
        IndexStoreError::Tree(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockIndexStoreConfig {
    /// Trust cached block hashes for sufficiently old records instead of
    /// re-hashing every header on reload.
    pub fast_hash_cache: bool,
}

impl Default for BlockIndexStoreConfig {
    fn default() -> Self {
        Self {
            fast_hash_cache: true,
        }
    }
}

pub struct BlockIndexStore<S> {
    store: Arc<S>,
    config: BlockIndexStoreConfig,
}

impl<S: KeyValueStore> BlockIndexStore<S> {
    pub fn new(store: Arc<S>, config: BlockIndexStoreConfig) -> Self {
        Self { store, config }
    }

    /// Queue a record write for this entry. The entry's stake detail must
    /// already be known; see [`DiskBlockIndex::from_entry`].
    pub fn put_entry(&self, batch: &mut WriteBatch, entry: &BlockIndexEntry) {
        let record = DiskBlockIndex::from_entry(entry);
        batch.put(Column::BlockIndex, entry.hash, record.encode());
    }

    pub fn record(&self, hash: &Hash256) -> Result<Option<DiskBlockIndex>, IndexStoreError> {
        let bytes = match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        Ok(Some(DiskBlockIndex::decode(&bytes)?))
    }

    pub fn set_best(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_BEST_BLOCK_KEY, *hash);
    }

    pub fn best_hash(&self) -> Result<Option<Hash256>, IndexStoreError> {
        let bytes = match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let hash: Hash256 = bytes
            .try_into()
            .map_err(|_| IndexStoreError::Corrupt("best block hash has wrong length"))?;
        Ok(Some(hash))
    }

    pub fn write_batch(&self, batch: &WriteBatch) -> Result<(), IndexStoreError> {
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Rebuild the in-memory tree from persisted records. Entries are
    /// relinked in height order, so every predecessor is inserted before
    /// its children; chain trust, skip pointers, and cumulative transaction
    /// counts are recomputed along the way.
    pub fn load_tree(&self, clock: &dyn TimeSource) -> Result<BlockTree, IndexStoreError> {
        let rows = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let adjusted_time = clock.adjusted_time();

        let mut records: Vec<(Hash256, DiskBlockIndex)> = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let key: Hash256 = key
                .try_into()
                .map_err(|_| IndexStoreError::Corrupt("block index key has wrong length"))?;
            let mut record = DiskBlockIndex::decode(&value)?;
            let hash = record.block_hash(self.config.fast_hash_cache, adjusted_time);
            if hash != key {
                ember_log::log_error!(
                    "block index record keyed {} hashes to {}",
                    hash_to_hex(&key),
                    hash_to_hex(&hash)
                );
                return Err(IndexStoreError::Corrupt("record hash does not match key"));
            }
            records.push((hash, record));
        }
        records.sort_by_key(|(hash, record)| (record.height, *hash));

        let mut tree = BlockTree::new();
        for (hash, record) in records {
            let stored_height = record.height;
            let prev_hash = record.prev_hash;
            tree.link_and_insert(record.into_entry(hash), prev_hash)?;
            let linked_height = tree
                .get(&hash)
                .map(|entry| entry.height)
                .unwrap_or_default();
            if linked_height != stored_height {
                ember_log::log_error!(
                    "block {} stored at height {} but links at {}",
                    hash_to_hex(&hash),
                    stored_height,
                    linked_height
                );
                return Err(IndexStoreError::Corrupt("stored height does not match links"));
            }
            tree.update_chain_tx(&hash);
        }

        match self.best_hash()? {
            Some(best) => ember_log::log_info!(
                "loaded {} block index entries, best block {}",
                tree.len(),
                hash_to_hex(&best)
            ),
            None => ember_log::log_info!("loaded {} block index entries", tree.len()),
        }
        Ok(tree)
    }
}
