//! Topic-based gossip over the DHT: random-peer fanout on publish,
//! digest-keyed dedup, and subscription dispatch on receipt.
//!
//! No ordering guarantees: handlers must tolerate duplicates, reorderings
//! and drops. Idempotence comes from message content, not the transport.

use dashmap::DashMap;
use lru::LruCache;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::crypto::sha256;
use crate::network::dht::{BroadcastSink, Dht};
use crate::network::message::GossipEnvelope;
use crate::network::node_id::Contact;
use crate::utils::metrics::METRICS;

/// Random peers targeted per publish.
pub const GOSSIP_FANOUT: usize = 20;

/// Subscription callback: invoked with the envelope and the peer it
/// arrived from. Handlers needing async work spawn it themselves.
pub type TopicHandler = Arc<dyn Fn(GossipEnvelope, Contact) + Send + Sync>;

pub struct Gossiper {
    dht: Arc<Dht>,
    topics: DashMap<String, TopicHandler>,
    dedup: Mutex<LruCache<[u8; 32], ()>>,
}

impl Gossiper {
    pub fn new(dht: Arc<Dht>, dedup_capacity: usize) -> Self {
        Self {
            dht,
            topics: DashMap::new(),
            dedup: Mutex::new(LruCache::new(dedup_capacity)),
        }
    }

    /// Register the handler for `topic`, replacing any previous one.
    pub fn subscribe(&self, topic: impl Into<String>, handler: TopicHandler) {
        self.topics.insert(topic.into(), handler);
    }

    /// Publish `payload` under `topic` to up to [`GOSSIP_FANOUT`] random
    /// healthy peers (bootstrap seeds when the health set is empty).
    /// Returns false when the payload was already seen.
    pub async fn publish(&self, topic: &str, payload: serde_json::Value, recursive: u8) -> bool {
        let envelope = GossipEnvelope { topic: topic.to_string(), recursive, payload };
        if !self.first_sighting(&envelope) {
            debug!("publish of duplicate {} payload skipped", topic);
            return false;
        }
        self.fan_out(envelope).await;
        true
    }

    /// Relay an envelope that already passed through the dedup cache on
    /// receipt, spending one hop of its relay budget.
    pub async fn republish(&self, mut envelope: GossipEnvelope) -> bool {
        if envelope.recursive == 0 {
            return false;
        }
        envelope.recursive -= 1;
        self.fan_out(envelope).await;
        true
    }

    async fn fan_out(&self, envelope: GossipEnvelope) {
        let mut peers = self.dht.random_healthy(GOSSIP_FANOUT).await;
        if peers.is_empty() {
            // fall back to the bootstrap set
            peers = self
                .dht
                .seeds()
                .iter()
                .map(|(host, port)| Contact::new(host.clone(), *port))
                .collect();
        }
        if peers.is_empty() {
            debug!("no peers for {} publish", envelope.topic);
            METRICS.inc("gossip.no_peers");
            return;
        }
        METRICS.inc("gossip.published");
        self.dht.broadcast_to(&peers, envelope).await;
    }

    /// Content key: digest of topic and payload bytes.
    fn dedup_key(envelope: &GossipEnvelope) -> [u8; 32] {
        let payload = serde_json::to_vec(&envelope.payload).unwrap_or_default();
        let mut keyed = Vec::with_capacity(envelope.topic.len() + 1 + payload.len());
        keyed.extend_from_slice(envelope.topic.as_bytes());
        keyed.push(0);
        keyed.extend_from_slice(&payload);
        sha256(&keyed)
    }

    /// Check-and-mark the dedup cache. True on first sighting.
    fn first_sighting(&self, envelope: &GossipEnvelope) -> bool {
        let key = Self::dedup_key(envelope);
        let mut dedup = self.dedup.lock().unwrap();
        if dedup.contains(&key) {
            return false;
        }
        dedup.put(key, ());
        true
    }
}

impl BroadcastSink for Gossiper {
    fn on_broadcast(&self, envelope: GossipEnvelope, from: &Contact) {
        if !self.first_sighting(&envelope) {
            METRICS.inc("gossip.duplicate");
            return;
        }
        let handler = match self.topics.get(&envelope.topic) {
            Some(handler) => handler.value().clone(),
            None => {
                debug!("unknown gossip topic {}; dropped", envelope.topic);
                METRICS.inc("gossip.unknown_topic");
                return;
            }
        };
        handler(envelope, from.clone());
    }
}
