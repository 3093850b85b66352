use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::crypto::{PublicKey, Signature};
use crate::utils::serde_helpers;

pub type Height = u64;

/// Block identifier. Depending on the `long_id` flag the codec writes it as
/// raw UTF-8 bytes (long mode) or as a decimal integer in 8 big-endian
/// bytes (short mode).
pub type BlockId = String;

/// Immutable snapshot of the feature flags taken once per hash operation,
/// so two concurrent rounds cannot straddle a flag flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFlags {
    pub long_id: bool,
}

/// Process-wide feature flags. Codec and engine operations snapshot these
/// into a [`ChainFlags`] at operation start and never re-read them.
#[derive(Debug)]
pub struct FeatureFlags {
    long_id: AtomicBool,
}

impl FeatureFlags {
    pub fn new(long_id: bool) -> Self {
        Self { long_id: AtomicBool::new(long_id) }
    }

    pub fn set_long_id(&self, on: bool) {
        self.long_id.store(on, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ChainFlags {
        ChainFlags { long_id: self.long_id.load(Ordering::SeqCst) }
    }
}

/// Candidate block header, read-only to the consensus core. `timestamp` is
/// seconds relative to the chain epoch and must fit an i32 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub height: Height,
    pub id: BlockId,
    pub timestamp: i64,
    pub generator_public_key: PublicKey,
}

/// Signed announcement by the elected delegate that it intends to extend
/// the chain with a specific block, bound to its network address by PoW.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Propose {
    pub height: Height,
    pub id: BlockId,
    pub timestamp: i64,
    pub generator_public_key: PublicKey,
    /// `<ipv4>:<port>` of the proposer's peer endpoint.
    pub address: String,
    /// PoW-masked SHA-256 digest the signature covers.
    #[serde(with = "serde_helpers::hex_array")]
    pub hash: [u8; 32],
    pub nonce: u64,
    pub signature: Signature,
}

/// One delegate's signature over the vote digest of `(height, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSignature {
    pub key: PublicKey,
    pub signature: Signature,
}

/// A vote bundle over one `(height, id)`. Keys are unique within one
/// logical vote set; the aggregator enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub height: Height,
    pub id: BlockId,
    pub timestamp: i64,
    pub signatures: Vec<VoteSignature>,
}

impl Vote {
    /// Empty accumulator for a block.
    pub fn for_block(block: &BlockHeader) -> Self {
        Self {
            height: block.height,
            id: block.id.clone(),
            timestamp: block.timestamp,
            signatures: Vec::new(),
        }
    }

    /// Whether this bundle targets the same `(height, id)` as `block`.
    pub fn matches(&self, block: &BlockHeader) -> bool {
        self.height == block.height && self.id == block.id
    }
}
