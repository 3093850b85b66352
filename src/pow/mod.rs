//! Address-bound proof-of-work: masked-SHA-256 puzzle tying a proposal to
//! its proposer.
//!
//! - verify: masking, hex-prefix check, difficulty derivation
//! - miner: multi-threaded nonce search with a wall-clock deadline

pub mod miner;
pub mod verify;

pub use miner::{Miner, MinerConfig, MintResult, PowError};
pub use verify::{difficulty_for_index, mask_bytes, pow_hash, verify_pow};
