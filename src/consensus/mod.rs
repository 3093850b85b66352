//! Consensus module: slot-bound block proposals with PoW address binding
//! and threshold vote aggregation.
//!
//! Public surface:
//! - ConsensusEngine: create/accept proposals, create/aggregate votes,
//!   commit signalling
//! - slots, types, codec, delegates, pending

pub mod codec;
pub mod delegates;
pub mod pending;
pub mod slots;
pub mod types;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::consensus::codec::CodecError;
use crate::consensus::delegates::DelegateRegistry;
use crate::consensus::pending::PendingState;
use crate::consensus::slots::SlotClock;
use crate::consensus::types::{BlockHeader, FeatureFlags, Propose, Vote, VoteSignature};
use crate::crypto::{Keypair, Signer, Verifier};
use crate::pow::{difficulty_for_index, verify_pow, Miner, PowError};
use crate::utils::metrics::METRICS;

/// Signatures a remote vote bundle must carry before this node relays it
/// further. A propagation bar, not a finality claim.
pub const REMOTE_VOTE_BAR: usize = 6;

#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("proof of work rejected")]
    PowInvalid,
    #[error("proposal signature rejected")]
    SignatureInvalid,
    #[error("generator is not in the active delegate ring")]
    IndexLookup,
    #[error("keypair does not match the block generator")]
    KeyMismatch,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Pow(#[from] PowError),
}

/// Derived round phase; the external block module commits on Committable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Proposed,
    Committable,
}

/// Emitted exactly once per round when the vote threshold is crossed.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub block: BlockHeader,
    pub votes: Vote,
}

/// The consensus state machine. Owns the pending block and vote accumulator
/// exclusively; every mutation is serialized behind one lock.
pub struct ConsensusEngine {
    clock: SlotClock,
    flags: Arc<FeatureFlags>,
    registry: Arc<dyn DelegateRegistry>,
    miner: Miner,
    state: Mutex<PendingState>,
    commit_tx: mpsc::UnboundedSender<CommitEvent>,
}

impl ConsensusEngine {
    /// Build the engine together with the commit-event receiver the block
    /// module consumes.
    pub fn new(
        clock: SlotClock,
        flags: Arc<FeatureFlags>,
        registry: Arc<dyn DelegateRegistry>,
        miner: Miner,
    ) -> (Self, mpsc::UnboundedReceiver<CommitEvent>) {
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let engine = Self {
            clock,
            flags,
            registry,
            miner,
            state: Mutex::new(PendingState::new()),
            commit_tx,
        };
        (engine, commit_rx)
    }

    pub fn clock(&self) -> &SlotClock {
        &self.clock
    }

    /// Build a signed, PoW-bound proposal for `block` advertised at
    /// `address`. Fails without touching pending state; a PoW timeout
    /// abandons the slot.
    pub async fn create_propose(
        &self,
        keypair: &Keypair,
        block: &BlockHeader,
        address: &str,
    ) -> Result<Propose, ProposeError> {
        if keypair.public() != block.generator_public_key {
            return Err(ProposeError::KeyMismatch);
        }
        let flags = self.flags.snapshot();
        let digest = codec::propose_digest(
            flags,
            block.height,
            &block.id,
            block.timestamp,
            &block.generator_public_key,
            address,
        )?;
        let src = hex::encode(digest);

        let index = self
            .registry
            .index_of(&block.generator_public_key)
            .ok_or(ProposeError::IndexLookup)?;
        let difficulty = difficulty_for_index(index, self.clock.leading());

        let miner = self.miner.clone();
        let timeout = self.clock.pow_timeout();
        let minted = tokio::task::spawn_blocking(move || miner.mint(&src, &difficulty, timeout))
            .await
            .map_err(|_| ProposeError::Pow(PowError::WorkerLost))??;

        let signature = keypair.sign(&minted.hash);
        Ok(Propose {
            height: block.height,
            id: block.id.clone(),
            timestamp: block.timestamp,
            generator_public_key: block.generator_public_key,
            address: address.to_string(),
            hash: minted.hash,
            nonce: minted.nonce,
            signature,
        })
    }

    /// Verify a received proposal: PoW first, then the Ed25519 signature
    /// over the masked hash.
    pub fn accept_propose(&self, propose: &Propose) -> Result<(), ProposeError> {
        let flags = self.flags.snapshot();
        let digest = codec::propose_digest_of(flags, propose)?;
        let src = hex::encode(digest);

        let index = self
            .registry
            .index_of(&propose.generator_public_key)
            .ok_or_else(|| {
                METRICS.inc("consensus.propose_index_missing");
                ProposeError::IndexLookup
            })?;
        let difficulty = difficulty_for_index(index, self.clock.leading());

        if !verify_pow(&src, propose.nonce, &propose.hash, &difficulty) {
            METRICS.inc("consensus.propose_pow_invalid");
            return Err(ProposeError::PowInvalid);
        }
        if !propose.generator_public_key.verify(&propose.hash, &propose.signature) {
            METRICS.inc("consensus.propose_signature_invalid");
            return Err(ProposeError::SignatureInvalid);
        }
        Ok(())
    }

    /// Install a fresh pending block, discarding any previous accumulator.
    pub async fn set_pending_block(&self, block: BlockHeader) {
        let mut state = self.state.lock().await;
        state.set_pending_block(block);
    }

    /// Whether a pending block exists for the slot of `ts`.
    pub async fn has_pending_block(&self, ts: i64) -> bool {
        let state = self.state.lock().await;
        state.has_pending_block(ts, &self.clock)
    }

    /// One vote per local forging keypair over the block's vote digest.
    pub fn create_votes(&self, keypairs: &[Keypair], block: &BlockHeader) -> Result<Vote, CodecError> {
        let flags = self.flags.snapshot();
        let digest = codec::vote_digest(flags, block.height, &block.id)?;
        let mut vote = Vote::for_block(block);
        for kp in keypairs {
            vote.signatures.push(VoteSignature { key: kp.public(), signature: kp.sign(&digest) });
        }
        Ok(vote)
    }

    /// Aggregate a vote bundle into the pending accumulator. Emits one
    /// commit event when the strict 2/3 threshold is crossed. Returns the
    /// accumulator snapshot, or None without a pending block.
    pub async fn add_pending_votes(&self, vote: &Vote) -> Option<Vote> {
        let flags = self.flags.snapshot();
        let mut state = self.state.lock().await;
        let before = state.pending_votes().map(|v| v.signatures.len()).unwrap_or(0);
        let acc = state.add_signatures(flags, vote)?;
        let threshold = self.clock.vote_threshold();
        if before <= threshold && acc.signatures.len() > threshold {
            if let Some(block) = state.pending_block().cloned() {
                info!(
                    "block ({}, {}) committable with {} signatures",
                    block.height,
                    block.id,
                    acc.signatures.len()
                );
                METRICS.inc("consensus.committable");
                let _ = self.commit_tx.send(CommitEvent { block, votes: acc.clone() });
            }
        }
        Some(acc)
    }

    /// Strict local-finality predicate: more than floor(2·D/3) signatures.
    pub fn has_enough_votes(&self, vote: &Vote) -> bool {
        vote.signatures.len() > self.clock.vote_threshold()
    }

    /// Relay bar for remote bundles; justifies propagation, not finality.
    pub fn has_enough_votes_remote(&self, vote: &Vote) -> bool {
        vote.signatures.len() >= REMOTE_VOTE_BAR
    }

    /// Reset all pending fields.
    pub async fn clear_state(&self) {
        let mut state = self.state.lock().await;
        state.clear();
    }

    /// Slot-boundary tick: drop a pending block whose slot has passed.
    pub async fn clear_stale(&self, now_ts: i64) {
        let mut state = self.state.lock().await;
        if let Some(block) = state.pending_block() {
            if !self.clock.same_slot(block.timestamp, now_ts) {
                debug!(
                    "slot boundary: clearing stale pending block ({}, {})",
                    block.height, block.id
                );
                METRICS.inc("consensus.round_expired");
                state.clear();
            }
        }
    }

    pub async fn phase(&self) -> Phase {
        let state = self.state.lock().await;
        match state.pending_block() {
            None => Phase::Idle,
            Some(_) => {
                let count = state.pending_votes().map(|v| v.signatures.len()).unwrap_or(0);
                if count > self.clock.vote_threshold() {
                    Phase::Committable
                } else {
                    Phase::Proposed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::delegates::StaticDelegates;
    use crate::pow::MinerConfig;
    use std::time::Duration;

    fn engine_with(
        keypairs: &[Keypair],
        delegates: u32,
        leading: u8,
        pow_timeout: Duration,
    ) -> (ConsensusEngine, mpsc::UnboundedReceiver<CommitEvent>) {
        let clock = SlotClock::new(0, 10, delegates, leading, pow_timeout).unwrap();
        let flags = Arc::new(FeatureFlags::new(false));
        let ring = keypairs.iter().map(|kp| kp.public()).collect();
        let registry = Arc::new(StaticDelegates::new(ring));
        let miner = Miner::new(MinerConfig { workers: 2, batch: 64 });
        ConsensusEngine::new(clock, flags, registry, miner)
    }

    fn block_for(kp: &Keypair) -> BlockHeader {
        BlockHeader {
            height: 100,
            id: "123456789012345".into(),
            timestamp: 1_000_000,
            generator_public_key: kp.public(),
        }
    }

    #[tokio::test]
    async fn test_propose_round_trip() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(30));
        let block = block_for(&kp);
        let propose = engine.create_propose(&kp, &block, "192.168.0.1:7000").await.unwrap();
        assert!(engine.accept_propose(&propose).is_ok());
    }

    #[tokio::test]
    async fn test_tampered_hash_rejected() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(30));
        let block = block_for(&kp);
        let propose = engine.create_propose(&kp, &block, "192.168.0.1:7000").await.unwrap();

        // flip a bit the mask keeps: PoW comparison fails
        let mut tampered = propose.clone();
        tampered.hash[0] ^= 0x01;
        assert!(matches!(engine.accept_propose(&tampered), Err(ProposeError::PowInvalid)));

        // flip a masked-out bit: re-masking cancels it, the signature check
        // still catches the altered bytes
        let mut masked = propose.clone();
        masked.hash[0] ^= 0x80;
        assert!(matches!(engine.accept_propose(&masked), Err(ProposeError::SignatureInvalid)));
    }

    #[tokio::test]
    async fn test_unknown_generator_rejected() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(30));
        let stranger = Keypair::generate();
        let block = block_for(&stranger);
        let err = engine.create_propose(&stranger, &block, "192.168.0.1:7000").await.unwrap_err();
        assert!(matches!(err, ProposeError::IndexLookup));
    }

    #[tokio::test]
    async fn test_keypair_must_match_generator() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(30));
        let block = block_for(&kp);
        let other = Keypair::generate();
        let err = engine.create_propose(&other, &block, "192.168.0.1:7000").await.unwrap_err();
        assert!(matches!(err, ProposeError::KeyMismatch));
    }

    #[tokio::test]
    async fn test_pow_timeout_abandons_slot() {
        let kp = Keypair::generate();
        // leading 8 needs ~2^24 expected hashes; the 1ms budget cannot
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 8, Duration::from_millis(1));
        let block = block_for(&kp);
        let err = engine.create_propose(&kp, &block, "192.168.0.1:7000").await.unwrap_err();
        assert!(matches!(err, ProposeError::Pow(PowError::Timeout(_))));
        assert_eq!(engine.phase().await, Phase::Idle);
    }

    #[tokio::test]
    async fn test_vote_threshold_is_strict() {
        let delegates: Vec<Keypair> = (0..101).map(|_| Keypair::generate()).collect();
        let (engine, mut commit_rx) =
            engine_with(&delegates, 101, 2, Duration::from_secs(5));
        let block = block_for(&delegates[0]);
        engine.set_pending_block(block.clone()).await;

        // 67 signatures: at the floor, not past it
        let first = engine.create_votes(&delegates[..67], &block).unwrap();
        let acc = engine.add_pending_votes(&first).await.unwrap();
        assert_eq!(acc.signatures.len(), 67);
        assert!(!engine.has_enough_votes(&acc));
        assert_eq!(engine.phase().await, Phase::Proposed);
        assert!(commit_rx.try_recv().is_err());

        // the 68th crosses it
        let last = engine.create_votes(&delegates[67..68], &block).unwrap();
        let acc = engine.add_pending_votes(&last).await.unwrap();
        assert_eq!(acc.signatures.len(), 68);
        assert!(engine.has_enough_votes(&acc));
        assert_eq!(engine.phase().await, Phase::Committable);
        let event = commit_rx.try_recv().unwrap();
        assert_eq!(event.block, block);
        assert_eq!(event.votes.signatures.len(), 68);

        // threshold is monotonic; no second commit event
        let again = engine.create_votes(&delegates[68..69], &block).unwrap();
        let acc = engine.add_pending_votes(&again).await.unwrap();
        assert!(engine.has_enough_votes(&acc));
        assert!(commit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_vote_bar() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(5));
        let block = block_for(&kp);
        let mut vote = Vote::for_block(&block);
        for _ in 0..5 {
            vote.signatures.push(VoteSignature {
                key: Keypair::generate().public(),
                signature: crate::crypto::Signature([0u8; 64]),
            });
        }
        assert!(!engine.has_enough_votes_remote(&vote));
        vote.signatures.push(VoteSignature {
            key: Keypair::generate().public(),
            signature: crate::crypto::Signature([0u8; 64]),
        });
        assert!(engine.has_enough_votes_remote(&vote));
    }

    #[tokio::test]
    async fn test_slot_boundary_clears_stale_round() {
        let kp = Keypair::generate();
        let (engine, _rx) = engine_with(std::slice::from_ref(&kp), 101, 2, Duration::from_secs(5));
        let block = block_for(&kp);
        engine.set_pending_block(block.clone()).await;
        assert!(engine.has_pending_block(block.timestamp).await);

        // same slot: untouched
        engine.clear_stale(block.timestamp + 1).await;
        assert_eq!(engine.phase().await, Phase::Proposed);

        // next slot: cleared
        engine.clear_stale(block.timestamp + 10).await;
        assert_eq!(engine.phase().await, Phase::Idle);
        assert!(!engine.has_pending_block(block.timestamp).await);
    }
}
