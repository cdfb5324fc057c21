//! Block index tree, active-chain tracking, and index persistence.
//!
//! The block index is a tree of per-block metadata rooted at genesis. Every
//! header ever seen gets an entry, valid or not; the `ActiveChain` view marks
//! which branch is currently best. All structures here expect a single
//! writer under the caller's chain-state lock.

pub mod blockindex;
pub mod chain;
pub mod clock;
pub mod diskindex;
pub mod flatfiles;
pub mod store;
pub mod tree;
pub mod trust;
