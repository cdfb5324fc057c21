//! Serializable projection of a block index entry.
//!
//! On disk the predecessor link becomes a hash and the block hash itself is
//! cached alongside the header fields, so reload can usually skip the
//! double-SHA256 per entry.

use ember_consensus::{hash_is_null, Amount, Hash256, NULL_HASH};
use ember_primitives::block::BlockHeader;
use ember_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ember_primitives::outpoint::OutPoint;

use crate::blockindex::{
    BlockIndexEntry, StakeState, BLOCK_HAVE_DATA, BLOCK_HAVE_MASK, BLOCK_HAVE_UNDO,
    FLAG_PROOF_OF_STAKE,
};

/// Layout version written ahead of every full record.
pub const DISK_INDEX_VERSION: u32 = 1;

/// Cached block hashes are trusted only once the block is at least this far
/// in the past, relative to adjusted time.
pub const HASH_CACHE_MIN_AGE: i64 = 24 * 60 * 60;

/// Field order is fixed for on-disk compatibility; integer fields use the
/// base-128 varint, conditional fields follow the status and stake flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskBlockIndex {
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub mint: Amount,
    pub money_supply: Amount,
    pub flags: u32,
    pub stake_modifier: u64,
    /// Coinstake kernel outpoint; null for proof-of-work records.
    pub kernel: OutPoint,
    pub stake_time: u32,
    pub proof_hash: Hash256,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    cached_hash: Option<Hash256>,
}

impl DiskBlockIndex {
    /// Project an in-memory entry for storage. The entry's stake detail
    /// must be known: a record cannot represent the `Unknown` state.
    pub fn from_entry(entry: &BlockIndexEntry) -> Self {
        let (kernel, stake_time) = match &entry.stake {
            StakeState::Unknown => panic!(
                "cannot persist a block index entry whose stake detail is unset"
            ),
            StakeState::ProofOfWork => (OutPoint::null(), 0),
            StakeState::ProofOfStake { kernel, time } => (kernel.clone(), *time),
        };
        debug_assert_eq!(
            entry.flags & FLAG_PROOF_OF_STAKE != 0,
            matches!(entry.stake, StakeState::ProofOfStake { .. })
        );
        Self {
            height: entry.height,
            status: entry.status,
            tx_count: entry.tx_count,
            file: entry.file,
            data_pos: entry.data_pos,
            undo_pos: entry.undo_pos,
            mint: entry.mint,
            money_supply: entry.money_supply,
            flags: entry.flags,
            stake_modifier: entry.stake_modifier,
            kernel,
            stake_time,
            proof_hash: entry.proof_hash,
            version: entry.version,
            prev_hash: entry.prev.unwrap_or(NULL_HASH),
            merkle_root: entry.merkle_root,
            time: entry.time,
            bits: entry.bits,
            nonce: entry.nonce,
            cached_hash: Some(entry.hash),
        }
    }

    /// Rebuild the in-memory entry. The predecessor link comes from the
    /// stored hash; skip pointers, chain trust, and the receive sequence
    /// are derived state and are left for the tree to recompute on
    /// insertion.
    pub fn into_entry(self, hash: Hash256) -> BlockIndexEntry {
        let stake = if self.flags & FLAG_PROOF_OF_STAKE != 0 {
            StakeState::ProofOfStake {
                kernel: self.kernel.clone(),
                time: self.stake_time,
            }
        } else {
            StakeState::ProofOfWork
        };
        let mut entry = BlockIndexEntry::from_header(hash, &self.header());
        entry.prev = if hash_is_null(&self.prev_hash) {
            None
        } else {
            Some(self.prev_hash)
        };
        entry.height = self.height;
        entry.status = self.status;
        entry.tx_count = self.tx_count;
        entry.file = self.file;
        entry.data_pos = self.data_pos;
        entry.undo_pos = self.undo_pos;
        entry.mint = self.mint;
        entry.money_supply = self.money_supply;
        entry.flags = self.flags;
        entry.stake_modifier = self.stake_modifier;
        entry.stake = stake;
        entry.proof_hash = self.proof_hash;
        entry
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// The block hash. When `fast_cache` is set and the block timestamp is
    /// older than [`HASH_CACHE_MIN_AGE`] relative to `adjusted_time`, a
    /// stored hash is returned without recomputation; otherwise the hash is
    /// recomputed from the header fields and memoized.
    pub fn block_hash(&mut self, fast_cache: bool, adjusted_time: i64) -> Hash256 {
        if fast_cache {
            if let Some(cached) = self.cached_hash {
                if i64::from(self.time) < adjusted_time - HASH_CACHE_MIN_AGE {
                    return cached;
                }
            }
        }
        let hash = self.header().hash();
        self.cached_hash = Some(hash);
        hash
    }

    pub fn cached_hash(&self) -> Option<Hash256> {
        self.cached_hash
    }

    /// Must be called after mutating any header field, or a stale cached
    /// hash may be served.
    pub fn invalidate_cached_hash(&mut self) {
        self.cached_hash = None;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(192);
        encoder.write_varint128(u64::from(DISK_INDEX_VERSION));
        self.encode_body(&mut encoder);
        encoder.into_inner()
    }

    /// Record bytes without the leading layout version, used when hashing
    /// the record itself.
    pub fn encode_for_hash(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(192);
        self.encode_body(&mut encoder);
        encoder.into_inner()
    }

    fn encode_body(&self, encoder: &mut Encoder) {
        encoder.write_varint128(self.height as u32 as u64);
        encoder.write_varint128(u64::from(self.status));
        encoder.write_varint128(u64::from(self.tx_count));
        if self.status & BLOCK_HAVE_MASK != 0 {
            encoder.write_varint128(self.file as u32 as u64);
        }
        if self.status & BLOCK_HAVE_DATA != 0 {
            encoder.write_varint128(u64::from(self.data_pos));
        }
        if self.status & BLOCK_HAVE_UNDO != 0 {
            encoder.write_varint128(u64::from(self.undo_pos));
        }
        encoder.write_varint128(self.mint as u64);
        encoder.write_varint128(self.money_supply as u64);
        encoder.write_u32_le(self.flags);
        encoder.write_u64_le(self.stake_modifier);
        if self.flags & FLAG_PROOF_OF_STAKE != 0 {
            self.kernel.consensus_encode(encoder);
            encoder.write_u32_le(self.stake_time);
        }
        encoder.write_hash_le(&self.proof_hash);
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_hash_le(&self.cached_hash.unwrap_or(NULL_HASH));
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let layout = decoder.read_varint128()?;
        if layout != u64::from(DISK_INDEX_VERSION) {
            return Err(DecodeError::InvalidData("unknown block index layout"));
        }
        let record = Self::decode_body(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(record)
    }

    fn decode_body(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let height = read_varint_u32(decoder)? as i32;
        let status = read_varint_u32(decoder)?;
        let tx_count = read_varint_u32(decoder)?;
        let file = if status & BLOCK_HAVE_MASK != 0 {
            read_varint_u32(decoder)? as i32
        } else {
            0
        };
        let data_pos = if status & BLOCK_HAVE_DATA != 0 {
            read_varint_u32(decoder)?
        } else {
            0
        };
        let undo_pos = if status & BLOCK_HAVE_UNDO != 0 {
            read_varint_u32(decoder)?
        } else {
            0
        };
        let mint = decoder.read_varint128()? as Amount;
        let money_supply = decoder.read_varint128()? as Amount;
        let flags = decoder.read_u32_le()?;
        let stake_modifier = decoder.read_u64_le()?;
        let (kernel, stake_time) = if flags & FLAG_PROOF_OF_STAKE != 0 {
            let kernel = OutPoint::consensus_decode(decoder)?;
            let stake_time = decoder.read_u32_le()?;
            (kernel, stake_time)
        } else {
            (OutPoint::null(), 0)
        };
        let proof_hash = decoder.read_hash_le()?;
        let version = decoder.read_i32_le()?;
        let prev_hash = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let stored_hash = decoder.read_hash_le()?;
        let cached_hash = if hash_is_null(&stored_hash) {
            None
        } else {
            Some(stored_hash)
        };
        Ok(Self {
            height,
            status,
            tx_count,
            file,
            data_pos,
            undo_pos,
            mint,
            money_supply,
            flags,
            stake_modifier,
            kernel,
            stake_time,
            proof_hash,
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
            cached_hash,
        })
    }
}

fn read_varint_u32(decoder: &mut Decoder) -> Result<u32, DecodeError> {
    let value = decoder.read_varint128()?;
    u32::try_from(value).map_err(|_| DecodeError::InvalidData("varint field exceeds 32 bits"))
}
