//! Pending-block bookkeeping: at most one candidate block per slot plus its
//! vote accumulator.
//!
//! Invariant between any two suspension points: `votes_key_set` holds
//! exactly the keys present in `pending_votes.signatures`.

use std::collections::HashSet;
use tracing::debug;

use crate::consensus::codec;
use crate::consensus::slots::SlotClock;
use crate::consensus::types::{BlockHeader, ChainFlags, Vote};
use crate::crypto::{PublicKey, Verifier};
use crate::utils::metrics::METRICS;

#[derive(Debug, Default)]
pub struct PendingState {
    pending_block: Option<BlockHeader>,
    pending_votes: Option<Vote>,
    votes_key_set: HashSet<PublicKey>,
}

impl PendingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh pending block, discarding any previous vote
    /// accumulator.
    pub fn set_pending_block(&mut self, block: BlockHeader) {
        self.pending_votes = None;
        self.votes_key_set.clear();
        self.pending_block = Some(block);
    }

    /// Reset all pending fields.
    pub fn clear(&mut self) {
        self.pending_block = None;
        self.pending_votes = None;
        self.votes_key_set.clear();
    }

    pub fn pending_block(&self) -> Option<&BlockHeader> {
        self.pending_block.as_ref()
    }

    pub fn pending_votes(&self) -> Option<&Vote> {
        self.pending_votes.as_ref()
    }

    /// True iff a pending block exists and shares the slot of `ts`. Used to
    /// reject stale rounds.
    pub fn has_pending_block(&self, ts: i64, clock: &SlotClock) -> bool {
        match &self.pending_block {
            Some(block) => clock.same_slot(block.timestamp, ts),
            None => false,
        }
    }

    /// Fold the signatures of `vote` into the accumulator.
    ///
    /// Per incoming item: dropped when the signer is already counted or the
    /// signature does not verify against the pending vote digest. A bundle
    /// for a different `(height, id)` leaves the accumulator unchanged.
    /// Returns a snapshot of the accumulator, or None without a pending
    /// block.
    pub fn add_signatures(&mut self, flags: ChainFlags, vote: &Vote) -> Option<Vote> {
        let block = match &self.pending_block {
            Some(block) => block,
            None => {
                METRICS.inc("consensus.vote_no_pending");
                return None;
            }
        };
        if !vote.matches(block) {
            METRICS.inc("consensus.vote_stale");
            debug!(
                "dropping vote bundle for ({}, {}); pending is ({}, {})",
                vote.height, vote.id, block.height, block.id
            );
            return self.snapshot_or_empty();
        }

        let digest = match codec::vote_digest(flags, block.height, &block.id) {
            Ok(digest) => digest,
            Err(e) => {
                METRICS.inc("consensus.vote_digest_failed");
                debug!("vote digest failed for pending block: {}", e);
                return self.snapshot_or_empty();
            }
        };

        for item in &vote.signatures {
            if self.votes_key_set.contains(&item.key) {
                METRICS.inc("consensus.vote_duplicate");
                continue;
            }
            if !item.key.verify(&digest, &item.signature) {
                METRICS.inc("consensus.vote_bad_signature");
                continue;
            }
            let acc = self
                .pending_votes
                .get_or_insert_with(|| Vote::for_block(block));
            acc.signatures.push(item.clone());
            self.votes_key_set.insert(item.key);
        }
        self.snapshot_or_empty()
    }

    fn snapshot_or_empty(&self) -> Option<Vote> {
        let block = self.pending_block.as_ref()?;
        Some(
            self.pending_votes
                .clone()
                .unwrap_or_else(|| Vote::for_block(block)),
        )
    }
}
