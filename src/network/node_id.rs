//! Overlay node identity: 160-bit RIPEMD-160 of the `host:port` endpoint,
//! with the XOR metric used for bucket placement and closeness.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::ripemd160;
use crate::utils::serde_helpers;

pub const ID_BITS: usize = 160;

/// 20-byte overlay identifier. Canonical for a node: two endpoints that
/// collide under RIPEMD-160 are treated as the same node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "serde_helpers::hex_array")] pub [u8; 20]);

impl NodeId {
    pub fn for_endpoint(host: &str, port: u16) -> Self {
        Self(ripemd160(format!("{}:{}", host, port).as_bytes()))
    }

    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index of `other` relative to `self`: bit length of the XOR
    /// distance minus one. None when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (i, byte) in distance.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return Some((ID_BITS - 8) - i * 8 + bit);
            }
        }
        None
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// Unix seconds now; the `seen` freshness stamp on contacts.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A known overlay node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    /// Unix seconds this contact was last heard from.
    pub seen: i64,
}

impl Contact {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self { id: NodeId::for_endpoint(&host, port), host, port, seen: unix_now() }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn touch(&mut self) {
        self.seen = unix_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic_per_endpoint() {
        let a = NodeId::for_endpoint("10.0.0.1", 7100);
        let b = NodeId::for_endpoint("10.0.0.1", 7100);
        let c = NodeId::for_endpoint("10.0.0.1", 7101);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_self() {
        let a = NodeId::for_endpoint("10.0.0.1", 7100);
        let b = NodeId::for_endpoint("10.0.0.2", 7100);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 20]);
    }

    #[test]
    fn test_bucket_index_tracks_highest_differing_bit() {
        let zero = NodeId([0u8; 20]);
        assert_eq!(zero.bucket_index(&zero), None);

        let mut top = [0u8; 20];
        top[0] = 0x80;
        assert_eq!(zero.bucket_index(&NodeId(top)), Some(159));

        let mut bottom = [0u8; 20];
        bottom[19] = 0x01;
        assert_eq!(zero.bucket_index(&NodeId(bottom)), Some(0));

        let mut mid = [0u8; 20];
        mid[10] = 0x10;
        // byte 10 holds bits 79..72; 0x10 is bit 76
        assert_eq!(zero.bucket_index(&NodeId(mid)), Some(76));
    }

    #[test]
    fn test_contact_endpoint_and_touch() {
        let mut contact = Contact::new("192.168.1.5", 7200);
        assert_eq!(contact.endpoint(), "192.168.1.5:7200");
        assert_eq!(contact.id, NodeId::for_endpoint("192.168.1.5", 7200));
        let before = contact.seen;
        contact.touch();
        assert!(contact.seen >= before);
    }
}
