//! Delegate index service: maps a proposal's generator key to its position
//! in the active delegate ring. The position feeds PoW difficulty
//! derivation, so lookups must be deterministic across nodes.

use std::collections::HashMap;

use crate::crypto::PublicKey;

/// Seam toward whatever owns the active delegate set. Implementations must
/// agree on ring order across the network.
pub trait DelegateRegistry: Send + Sync + 'static {
    /// Position of `key` in the active ring, if it is a delegate.
    fn index_of(&self, key: &PublicKey) -> Option<u32>;

    /// Size of the active ring.
    fn ring_len(&self) -> u32;
}

/// Fixed delegate ring loaded from configuration. The index of a key is its
/// position in the configured order.
pub struct StaticDelegates {
    ring: Vec<PublicKey>,
    positions: HashMap<PublicKey, u32>,
}

impl StaticDelegates {
    pub fn new(ring: Vec<PublicKey>) -> Self {
        let mut positions = HashMap::with_capacity(ring.len());
        for (i, key) in ring.iter().enumerate() {
            // first occurrence wins if a key is listed twice
            positions.entry(*key).or_insert(i as u32);
        }
        Self { ring, positions }
    }

    pub fn ring(&self) -> &[PublicKey] {
        &self.ring
    }
}

impl DelegateRegistry for StaticDelegates {
    fn index_of(&self, key: &PublicKey) -> Option<u32> {
        self.positions.get(key).copied()
    }

    fn ring_len(&self) -> u32 {
        self.ring.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_index_follows_ring_order() {
        let keys: Vec<PublicKey> = (0..3).map(|_| Keypair::generate().public()).collect();
        let delegates = StaticDelegates::new(keys.clone());
        assert_eq!(delegates.ring_len(), 3);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(delegates.index_of(key), Some(i as u32));
        }
    }

    #[test]
    fn test_unknown_key_has_no_index() {
        let delegates = StaticDelegates::new(vec![Keypair::generate().public()]);
        assert_eq!(delegates.index_of(&Keypair::generate().public()), None);
    }

    #[test]
    fn test_duplicate_key_keeps_first_position() {
        let key = Keypair::generate().public();
        let delegates = StaticDelegates::new(vec![key, key]);
        assert_eq!(delegates.index_of(&key), Some(0));
    }
}
