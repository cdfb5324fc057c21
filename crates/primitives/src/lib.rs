//! Block, transaction, and byte-level encoding primitives.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
