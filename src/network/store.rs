//! Persisted peer store: sled-backed document store keyed by node id, with
//! a secondary `seen` index used for pruning. Single-writer: only the
//! DHT's flush task touches it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::network::node_id::{Contact, NodeId};

/// Records older than this are pruned at flush time.
const PRUNE_PEER_AGE_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("peer store db: {0}")]
    Db(#[from] sled::Error),
    #[error("peer store encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// On-disk peer record. `id` is the hex of the canonical 20-byte node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub seen: i64,
}

impl From<&Contact> for PeerRecord {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id.to_hex(),
            host: contact.host.clone(),
            port: contact.port,
            seen: contact.seen,
        }
    }
}

impl PeerRecord {
    /// Rebuild a contact; the id is re-derived from the endpoint, which is
    /// canonical.
    pub fn contact(&self) -> Contact {
        Contact {
            id: NodeId::for_endpoint(&self.host, self.port),
            host: self.host.clone(),
            port: self.port,
            seen: self.seen,
        }
    }
}

pub struct PeerStore {
    peers: sled::Tree,
    by_seen: sled::Tree,
    db: sled::Db,
}

impl PeerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let peers = db.open_tree("peers")?;
        let by_seen = db.open_tree("peers_by_seen")?;
        Ok(Self { peers, by_seen, db })
    }

    /// All persisted contacts, skipping records that no longer decode.
    pub fn load_all(&self) -> Vec<Contact> {
        let mut out = Vec::new();
        for item in self.peers.iter() {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    warn!("peer store iteration failed: {}", e);
                    break;
                }
            };
            match serde_json::from_slice::<PeerRecord>(&value) {
                Ok(record) => out.push(record.contact()),
                Err(e) => {
                    warn!("dropping undecodable peer record {}: {}", hex::encode(&key), e);
                }
            }
        }
        out
    }

    /// Upsert the current table contents and prune entries not seen within
    /// the retention window.
    pub fn save(&self, contacts: &[Contact]) -> Result<(), StoreError> {
        for contact in contacts {
            self.upsert(contact)?;
        }
        self.prune_older_than(crate::network::node_id::unix_now() - PRUNE_PEER_AGE_SECS)?;
        Ok(())
    }

    fn upsert(&self, contact: &Contact) -> Result<(), StoreError> {
        let key = contact.id.0;
        // drop a stale seen-index entry before writing the new one
        if let Some(previous) = self.peers.get(&key[..])? {
            if let Ok(record) = serde_json::from_slice::<PeerRecord>(&previous) {
                self.by_seen.remove(seen_key(record.seen, &key))?;
            }
        }
        let record = PeerRecord::from(contact);
        self.peers.insert(&key[..], serde_json::to_vec(&record)?)?;
        self.by_seen.insert(seen_key(contact.seen, &key), &key[..])?;
        Ok(())
    }

    fn prune_older_than(&self, cutoff: i64) -> Result<(), StoreError> {
        let end = seen_key(cutoff, &[0xff; 20]);
        let mut doomed = Vec::new();
        for item in self.by_seen.range(..end) {
            let (index_key, peer_key) = item?;
            doomed.push((index_key.to_vec(), peer_key.to_vec()));
        }
        for (index_key, peer_key) in doomed {
            self.by_seen.remove(index_key)?;
            self.peers.remove(peer_key)?;
        }
        Ok(())
    }

    /// Flush outstanding writes to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index key ordering records by `seen` then id. The offset keeps negative
/// timestamps ordered below positive ones.
fn seen_key(seen: i64, id: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(&(seen as u64 ^ (1u64 << 63)).to_be_bytes());
    key.extend_from_slice(id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::node_id::unix_now;

    fn temp_store(tag: &str) -> PeerStore {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let path = std::env::temp_dir().join(format!(
            "forgemesh-store-{}-{}-{}",
            tag,
            std::process::id(),
            nanos
        ));
        PeerStore::open(path).unwrap()
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = temp_store("round-trip");
        let contacts = vec![Contact::new("10.0.0.1", 7100), Contact::new("10.0.0.2", 7100)];
        store.save(&contacts).unwrap();

        let mut loaded = store.load_all();
        loaded.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].host, "10.0.0.1");
        assert_eq!(loaded[0].id, contacts[0].id);
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let store = temp_store("upsert");
        let mut contact = Contact::new("10.0.0.1", 7100);
        store.save(std::slice::from_ref(&contact)).unwrap();
        contact.seen += 60;
        store.save(std::slice::from_ref(&contact)).unwrap();

        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].seen, contact.seen);
    }

    #[test]
    fn test_prune_drops_expired_records() {
        let store = temp_store("prune");
        let fresh = Contact::new("10.0.0.1", 7100);
        let mut expired = Contact::new("10.0.0.2", 7100);
        expired.seen = unix_now() - PRUNE_PEER_AGE_SECS - 60;
        store.save(&[fresh.clone(), expired]).unwrap();

        let loaded = store.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, fresh.id);
    }
}
