//! Per-block index entries, status bits, and validity staging.

use std::fmt;

use ember_consensus::{format_money, Amount, Hash256, NULL_HASH};
use ember_primitives::block::{Block, BlockHeader};
use ember_primitives::hash::hash_to_hex;
use ember_primitives::outpoint::OutPoint;
use primitive_types::U256;

/// Position of a block or undo record within the flat file set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPosition {
    pub file: i32,
    pub offset: u32,
}

impl BlockPosition {
    pub fn new(file: i32, offset: u32) -> Self {
        Self { file, offset }
    }

    pub fn null() -> Self {
        Self {
            file: -1,
            offset: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.file == -1
    }
}

// The low three bits of `status` hold the validity stage; the remaining bits
// are independent flags.
pub const BLOCK_VALID_MASK: u32 = 0x07;
pub const BLOCK_HAVE_DATA: u32 = 1 << 3;
pub const BLOCK_HAVE_UNDO: u32 = 1 << 4;
pub const BLOCK_HAVE_MASK: u32 = BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO;
pub const BLOCK_FAILED_VALID: u32 = 1 << 5;
pub const BLOCK_FAILED_CHILD: u32 = 1 << 6;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

/// Validation stages a block moves through, strictly ordered. Each stage
/// implies all earlier ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum ValidityStage {
    /// Header parsed, version acceptable, claimed work satisfied.
    Header = 1,
    /// All parent headers found, difficulty and timestamp checks passed.
    Tree = 2,
    /// Transaction list well-formed: coinbase placement, merkle root, size.
    Transactions = 3,
    /// No overspends or double spends against the parent chain.
    Chain = 4,
    /// Scripts and signatures verified.
    Scripts = 5,
}

impl ValidityStage {
    pub const fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(Self::Header),
            2 => Some(Self::Tree),
            3 => Some(Self::Transactions),
            4 => Some(Self::Chain),
            5 => Some(Self::Scripts),
            _ => None,
        }
    }
}

// Proof-of-stake index flags.
pub const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const FLAG_STAKE_ENTROPY: u32 = 1 << 1;
pub const FLAG_STAKE_MODIFIER: u32 = 1 << 2;

/// What is known about a block's proof-of-stake membership. Under
/// headers-first sync an entry is linked before its body arrives, so stake
/// detail starts out `Unknown`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StakeState {
    Unknown,
    ProofOfWork,
    ProofOfStake {
        /// First input of the coinstake transaction.
        kernel: OutPoint,
        /// Timestamp of the coinstake transaction.
        time: u32,
    },
}

/// A node in the block tree. Predecessor and skip links are hash keys into
/// the owning [`BlockTree`](crate::tree::BlockTree) arena, never raw
/// references.
#[derive(Clone, Debug)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Option<Hash256>,
    /// Cached shortcut to a further predecessor, rebuilt on insertion.
    pub skip: Option<Hash256>,
    /// Genesis has height 0.
    pub height: i32,
    /// Cumulative trust from genesis through this block.
    pub chain_trust: U256,

    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,

    /// Declared transaction count; untrusted until the body is validated.
    pub tx_count: u32,
    /// Cumulative transaction count from genesis, or zero when some
    /// ancestor's transactions are still missing.
    pub chain_tx_count: u64,

    pub status: u32,

    pub mint: Amount,
    pub money_supply: Amount,

    pub flags: u32,
    pub stake_modifier: u64,
    pub stake: StakeState,
    pub proof_hash: Hash256,

    // Header fields, enough to reconstruct the header without the body.
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,

    /// Arrival-order tiebreak between tips of equal trust. Not consensus
    /// data; reassigned on reload.
    pub sequence_id: u64,
}

impl BlockIndexEntry {
    pub fn from_header(hash: Hash256, header: &BlockHeader) -> Self {
        Self {
            hash,
            prev: None,
            skip: None,
            height: 0,
            chain_trust: U256::zero(),
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            tx_count: 0,
            chain_tx_count: 0,
            status: 0,
            mint: 0,
            money_supply: 0,
            flags: 0,
            stake_modifier: 0,
            stake: StakeState::Unknown,
            proof_hash: NULL_HASH,
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            sequence_id: 0,
        }
    }

    pub fn block_position(&self) -> Option<BlockPosition> {
        if self.status & BLOCK_HAVE_DATA != 0 {
            Some(BlockPosition::new(self.file, self.data_pos))
        } else {
            None
        }
    }

    pub fn undo_position(&self) -> Option<BlockPosition> {
        if self.status & BLOCK_HAVE_UNDO != 0 {
            Some(BlockPosition::new(self.file, self.undo_pos))
        } else {
            None
        }
    }

    /// Reconstruct the block header from stored fields. Genesis gets the
    /// null previous hash.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev.unwrap_or(NULL_HASH),
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    /// Earliest timestamp a successor may carry, allowing 120 seconds of
    /// clock drift.
    pub fn past_time_limit(&self) -> i64 {
        self.block_time() - 120
    }

    /// True iff this entry has reached `up_to` and no failure flag is set.
    pub fn is_valid(&self, up_to: ValidityStage) -> bool {
        if self.status & BLOCK_FAILED_MASK != 0 {
            return false;
        }
        (self.status & BLOCK_VALID_MASK) >= up_to.bits()
    }

    /// Raise the validity stage. Returns true if the stage changed; a
    /// failed entry or an already-reached stage is a no-op.
    pub fn raise_validity(&mut self, up_to: ValidityStage) -> bool {
        if self.status & BLOCK_FAILED_MASK != 0 {
            return false;
        }
        if (self.status & BLOCK_VALID_MASK) < up_to.bits() {
            self.status = (self.status & !BLOCK_VALID_MASK) | up_to.bits();
            return true;
        }
        false
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn is_proof_of_work(&self) -> bool {
        !matches!(self.stake, StakeState::ProofOfStake { .. })
    }

    /// Whether this block is proof-of-stake. Calling this before
    /// [`set_stake_detail`](Self::set_stake_detail) is a caller bug.
    pub fn is_proof_of_stake(&self) -> bool {
        match self.stake {
            StakeState::Unknown => panic!(
                "proof-of-stake detail queried before the body of {} arrived",
                hash_to_hex(&self.hash)
            ),
            StakeState::ProofOfWork => false,
            StakeState::ProofOfStake { .. } => true,
        }
    }

    /// Derive stake membership from the full block body. Must be called
    /// exactly once, after the body (not just the header) is available.
    pub fn set_stake_detail(&mut self, block: &Block) {
        assert!(
            matches!(self.stake, StakeState::Unknown),
            "stake detail already set for {}",
            hash_to_hex(&self.hash)
        );
        match block.coinstake() {
            Some(coinstake) => {
                self.flags |= FLAG_PROOF_OF_STAKE;
                self.stake = StakeState::ProofOfStake {
                    kernel: coinstake.vin[0].prevout.clone(),
                    time: coinstake.time,
                };
            }
            None => {
                self.stake = StakeState::ProofOfWork;
            }
        }
    }

    pub fn stake_entropy_bit(&self) -> u32 {
        (self.flags & FLAG_STAKE_ENTROPY) >> 1
    }

    /// Record the entropy bit for stake-modifier generation. Rejects any
    /// value other than 0 or 1 without mutating.
    pub fn set_stake_entropy_bit(&mut self, bit: u32) -> bool {
        if bit > 1 {
            return false;
        }
        if bit != 0 {
            self.flags |= FLAG_STAKE_ENTROPY;
        }
        true
    }

    pub fn generated_stake_modifier(&self) -> bool {
        self.flags & FLAG_STAKE_MODIFIER != 0
    }

    pub fn set_stake_modifier(&mut self, modifier: u64, generated: bool) {
        self.stake_modifier = modifier;
        if generated {
            self.flags |= FLAG_STAKE_MODIFIER;
        }
    }
}

impl fmt::Display for BlockIndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.stake {
            StakeState::Unknown => "?",
            StakeState::ProofOfWork => "PoW",
            StakeState::ProofOfStake { .. } => "PoS",
        };
        write!(
            f,
            "BlockIndexEntry(hash={}, height={}, mint={}, supply={}, flags=({}|{}|{}), modifier={:016x})",
            hash_to_hex(&self.hash),
            self.height,
            format_money(self.mint),
            format_money(self.money_supply),
            if self.generated_stake_modifier() { "MOD" } else { "-" },
            self.stake_entropy_bit(),
            kind,
            self.stake_modifier,
        )
    }
}
