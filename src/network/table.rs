//! Kademlia-style routing table: 160 buckets of up to K contacts, ordered
//! least-recently-seen first within a bucket.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, Instant};

use crate::network::node_id::{Contact, NodeId, ID_BITS};

/// K: contacts kept per bucket.
pub const BUCKET_SIZE: usize = 20;

/// A full bucket evicts its oldest entry only when the incumbent has not
/// been heard from for this long relative to the newcomer.
const EVICT_AGE_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Updated,
    /// Bucket full and the oldest incumbent is still fresh.
    Discarded,
    /// The candidate is the local node.
    SelfId,
}

#[derive(Debug)]
struct Bucket {
    /// Oldest-seen first; refreshed contacts move to the tail.
    contacts: Vec<Contact>,
    refreshed_at: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self { contacts: Vec::new(), refreshed_at: Instant::now() }
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        Self { local, buckets: (0..ID_BITS).map(|_| Bucket::new()).collect() }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        let index = match self.local.bucket_index(&contact.id) {
            Some(index) => index,
            None => return InsertOutcome::SelfId,
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = bucket.contacts.remove(pos);
            existing.seen = existing.seen.max(contact.seen);
            existing.host = contact.host;
            existing.port = contact.port;
            bucket.contacts.push(existing);
            return InsertOutcome::Updated;
        }

        if bucket.contacts.len() < BUCKET_SIZE {
            bucket.contacts.push(contact);
            return InsertOutcome::Added;
        }

        // bucket full: the head is the least-recently-seen incumbent
        if contact.seen - bucket.contacts[0].seen > EVICT_AGE_SECS {
            bucket.contacts.remove(0);
            bucket.contacts.push(contact);
            return InsertOutcome::Added;
        }
        InsertOutcome::Discarded
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.local.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.contacts.iter().position(|c| &c.id == id)?;
        Some(bucket.contacts.remove(pos))
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        match self.local.bucket_index(id) {
            Some(index) => self.buckets[index].contacts.iter().any(|c| &c.id == id),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter().cloned()).collect()
    }

    /// Up to `n` known contacts closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut all = self.contacts();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(n);
        all
    }

    /// Up to `n` contacts sampled uniformly.
    pub fn sample(&self, n: usize) -> Vec<Contact> {
        let all = self.contacts();
        let mut rng = rand::thread_rng();
        all.choose_multiple(&mut rng, n).cloned().collect()
    }

    /// Indices of non-empty buckets not refreshed within `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.contacts.is_empty() && now.duration_since(b.refreshed_at) >= max_age
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.refreshed_at = Instant::now();
        }
    }

    /// A random id that lands in bucket `index` relative to the local id;
    /// the lookup target for refreshing that bucket.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut id = self.local.0;
        let byte = (ID_BITS - 1 - index) / 8;
        let bit = index % 8;
        // flip the bucket's defining bit, randomize everything below it
        id[byte] ^= 1 << bit;
        let mut rng = rand::thread_rng();
        for i in (byte + 1)..id.len() {
            id[i] = rng.gen();
        }
        let low_mask: u8 = ((1u16 << bit) - 1) as u8;
        id[byte] = (id[byte] & !low_mask) | (rng.gen::<u8>() & low_mask);
        NodeId(id)
    }
}
