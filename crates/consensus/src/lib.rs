//! Consensus-level shared types and monetary rules.

pub mod money;

pub use money::{format_money, money_range, Amount, CENT, COIN, MAX_MONEY};

/// A 256-bit digest, stored little-endian as on the wire.
pub type Hash256 = [u8; 32];

/// The all-zero digest, used as the "no predecessor" sentinel.
pub const NULL_HASH: Hash256 = [0u8; 32];

pub fn hash_is_null(hash: &Hash256) -> bool {
    *hash == NULL_HASH
}
