//! Node orchestration: wire up the peer store, DHT, gossip, consensus
//! engine and the peer HTTP surface, then keep the periodic work running
//! until shutdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::consensus::delegates::StaticDelegates;
use crate::consensus::types::{BlockHeader, FeatureFlags, Propose, Vote};
use crate::consensus::{CommitEvent, ConsensusEngine};
use crate::crypto::Keypair;
use crate::network::dht::{Dht, DhtConfig, DhtEvent, RECONNECT_SEED_INTERVAL};
use crate::network::gossip::Gossiper;
use crate::network::http::{PeerApiContext, PeerHandler, PeerServer};
use crate::network::message::GossipEnvelope;
use crate::network::node_id::Contact;
use crate::network::peer_client::PeerClient;
use crate::network::store::PeerStore;
use crate::node::config::NodeConfig;
use crate::node::service_handle::ServiceHandle;
use crate::pow::Miner;
use crate::utils::metrics::METRICS;

/// Well-known gossip topics of the consensus data plane.
pub const TOPIC_PROPOSE: &str = "propose";
pub const TOPIC_VOTES: &str = "votes";

const GOSSIP_DEDUP_CAPACITY: usize = 10_000;

pub struct Node {
    cfg: NodeConfig,
}

impl Node {
    pub fn new(cfg: NodeConfig) -> Self {
        Self { cfg }
    }

    /// Start every subsystem and return the handle that shuts them down.
    pub async fn start(self) -> Result<ServiceHandle> {
        let cfg = self.cfg;
        std::fs::create_dir_all(&cfg.data_dir)?;

        let (mut svc, shutdown_rx) = ServiceHandle::new();

        // -----------------------
        // Consensus engine
        // -----------------------
        let clock = cfg.slot_clock().context("slot parameters")?;
        let flags = Arc::new(FeatureFlags::new(cfg.long_id));
        let registry = Arc::new(StaticDelegates::new(cfg.delegate_ring()?));
        let miner = Miner::from_config_file().context("miner config")?;
        let (engine, mut commit_rx) = ConsensusEngine::new(clock.clone(), flags, registry, miner);
        let engine = Arc::new(engine);
        let forging_keys = cfg.forging_keypairs()?;

        // -----------------------
        // Overlay (peer store -> DHT -> gossip)
        // -----------------------
        let store = if cfg.peers.persistent {
            Some(PeerStore::open(cfg.data_dir.join("peers")).context("peer store")?)
        } else {
            None
        };
        let dht_cfg = DhtConfig {
            host: cfg.public_ip.clone(),
            port: cfg.peer_port,
            seeds: cfg.seed_pairs()?,
            black_list: cfg.black_list_set(),
        };
        let (dht, mut dht_events) = Dht::bind(dht_cfg, store).await.context("overlay bind")?;
        let gossiper = Arc::new(Gossiper::new(dht.clone(), GOSSIP_DEDUP_CAPACITY));
        dht.set_broadcast_sink(gossiper.clone());

        // -----------------------
        // Consensus <-> gossip bridge
        // -----------------------
        let bridge = Arc::new(ConsensusBridge {
            engine: engine.clone(),
            gossiper: gossiper.clone(),
            forging_keys,
        });
        {
            let b = bridge.clone();
            gossiper.subscribe(
                TOPIC_PROPOSE,
                Arc::new(move |envelope, _from| {
                    let b = b.clone();
                    tokio::spawn(async move { b.ingest_propose(envelope).await });
                }),
            );
        }
        {
            let b = bridge.clone();
            gossiper.subscribe(
                TOPIC_VOTES,
                Arc::new(move |envelope, _from| {
                    let b = b.clone();
                    tokio::spawn(async move { b.ingest_votes(envelope).await });
                }),
            );
        }

        // overlay service tasks (accept loop, bootstrap, timers)
        svc.attach_all("overlay", dht.start(shutdown_rx.clone()));

        // persist the final table state once the overlay tasks are gone;
        // the store is single-writer, so this must not race the save timer
        {
            let dht = dht.clone();
            svc.on_shutdown("peer table flush", move || async move {
                dht.save_peers().await;
            });
        }

        // overlay lifecycle events: logged and counted, never fatal
        {
            let mut shutdown = shutdown_rx.clone();
            svc.attach("overlay events", tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        event = dht_events.recv() => match event {
                            Some(DhtEvent::NodeAdded(contact)) => {
                                debug!("overlay node added: {}", contact.endpoint());
                            }
                            Some(DhtEvent::NodeRemoved(id, reason)) => {
                                debug!("overlay node removed: {:?} ({:?})", id, reason);
                            }
                            Some(DhtEvent::PublicIpChanged { ip, port, authoritative }) => {
                                info!("public ip changed to {}:{} (authoritative={})", ip, port, authoritative);
                                METRICS.inc("node.public_ip_changed");
                            }
                            None => return Ok(()),
                        }
                    }
                }
            }));
        }

        // -----------------------
        // Commit events (hand-off point for the block module)
        // -----------------------
        {
            let mut shutdown = shutdown_rx.clone();
            svc.attach("commit loop", tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        event = commit_rx.recv() => match event {
                            Some(CommitEvent { block, votes }) => {
                                info!(
                                    "committing block ({}, {}) with {} votes",
                                    block.height, block.id, votes.signatures.len()
                                );
                                METRICS.inc("consensus.committed");
                                METRICS.set_gauge("consensus.last_committed_height", block.height as f64);
                            }
                            None => return Ok(()),
                        }
                    }
                }
            }));
        }

        // -----------------------
        // Slot boundary ticker
        // -----------------------
        {
            let engine = engine.clone();
            let clock = clock.clone();
            let mut shutdown = shutdown_rx.clone();
            svc.attach("slot ticker", tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tick.tick() => engine.clear_stale(clock.epoch_now()).await,
                    }
                }
            }));
        }

        // -----------------------
        // Peer HTTP surface (one port below the overlay)
        // -----------------------
        let version = env!("CARGO_PKG_VERSION").to_string();
        {
            let handler = Arc::new(NodePeerHandler { bridge: bridge.clone() });
            let ctx = Arc::new(PeerApiContext {
                dht: dht.clone(),
                handler,
                magic: cfg.magic.clone(),
                version: version.clone(),
                build: option_env!("FORGEMESH_BUILD").unwrap_or("dev").to_string(),
                net: cfg.net_version.as_str().to_string(),
                min_version: cfg.net_version.min_peer_version(),
            });
            let addr = SocketAddr::from(([0, 0, 0, 0], cfg.peer_port - 1));
            let server = PeerServer::new(addr, ctx);
            let shutdown = shutdown_rx.clone();
            svc.attach("peer api", tokio::spawn(async move { server.serve(shutdown).await }));
        }

        // -----------------------
        // Self-IP discovery
        // -----------------------
        if cfg.acquire_ip {
            let dht = dht.clone();
            let seeds = cfg.seed_pairs()?;
            let client = PeerClient::new(cfg.magic.clone(), version, Duration::from_secs(4))
                .map_err(|e| anyhow::anyhow!("peer client: {}", e))?;
            let mut shutdown = shutdown_rx.clone();
            svc.attach("ip discovery", tokio::spawn(async move {
                let mut tick = tokio::time::interval(RECONNECT_SEED_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tick.tick() => discover_public_ip(&dht, &seeds, &client).await,
                    }
                }
            }));
        }

        info!(
            "node started: overlay on {}, peer api on {}",
            cfg.peer_port,
            cfg.peer_port - 1
        );
        Ok(svc)
    }
}

/// Ask bootstrap peers for our externally-observed address; the first
/// answer wins.
async fn discover_public_ip(dht: &Arc<Dht>, seeds: &[(String, u16)], client: &PeerClient) {
    let current = dht.self_contact().host;
    for (host, port) in seeds {
        let contact = Contact::new(host.clone(), *port);
        match client.observed_ip(&contact).await {
            Ok(ip) => {
                if ip.parse::<std::net::Ipv4Addr>().is_err() {
                    debug!("seed {} reported non-ipv4 address {}", contact.endpoint(), ip);
                    continue;
                }
                if ip != current {
                    dht.set_public_ip(&ip, true);
                }
                return;
            }
            Err(e) => {
                debug!("p2phelper via {} failed: {}", contact.endpoint(), e);
            }
        }
    }
}

/// Shared ingest paths for consensus messages, fed by both the gossip
/// subscriptions and the peer HTTP surface. Handlers are idempotent by
/// content, so duplicate delivery across the two paths is harmless.
pub struct ConsensusBridge {
    engine: Arc<ConsensusEngine>,
    gossiper: Arc<Gossiper>,
    forging_keys: Vec<Keypair>,
}

impl ConsensusBridge {
    pub fn new(
        engine: Arc<ConsensusEngine>,
        gossiper: Arc<Gossiper>,
        forging_keys: Vec<Keypair>,
    ) -> Self {
        Self { engine, gossiper, forging_keys }
    }

    /// Verify a received proposal, adopt its block as the slot's pending
    /// candidate, answer with our delegate votes, and relay one hop.
    pub async fn ingest_propose(&self, envelope: GossipEnvelope) {
        let propose: Propose = match serde_json::from_value(envelope.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                debug!("undecodable propose payload: {}", e);
                METRICS.inc("consensus.propose_undecodable");
                return;
            }
        };
        if let Err(e) = self.engine.accept_propose(&propose) {
            debug!("propose ({}, {}) rejected: {}", propose.height, propose.id, e);
            return;
        }

        if !self.engine.has_pending_block(propose.timestamp).await {
            let header = BlockHeader {
                height: propose.height,
                id: propose.id.clone(),
                timestamp: propose.timestamp,
                generator_public_key: propose.generator_public_key,
            };
            self.engine.set_pending_block(header.clone()).await;
            info!("pending block ({}, {}) adopted", header.height, header.id);

            if !self.forging_keys.is_empty() {
                match self.engine.create_votes(&self.forging_keys, &header) {
                    Ok(vote) => {
                        // our own signatures count locally before fanout
                        self.engine.add_pending_votes(&vote).await;
                        match serde_json::to_value(&vote) {
                            Ok(payload) => {
                                self.gossiper.publish(TOPIC_VOTES, payload, 1).await;
                            }
                            Err(e) => warn!("vote encode failed: {}", e),
                        }
                    }
                    Err(e) => warn!("local vote creation failed: {}", e),
                }
            }
        }

        self.gossiper.republish(envelope).await;
    }

    /// Aggregate a received vote bundle; relay it only when it already
    /// carries enough signatures to justify propagation.
    pub async fn ingest_votes(&self, envelope: GossipEnvelope) {
        let vote: Vote = match serde_json::from_value(envelope.payload.clone()) {
            Ok(v) => v,
            Err(e) => {
                debug!("undecodable vote payload: {}", e);
                METRICS.inc("consensus.votes_undecodable");
                return;
            }
        };
        self.engine.add_pending_votes(&vote).await;
        if self.engine.has_enough_votes_remote(&vote) {
            self.gossiper.republish(envelope).await;
        }
    }
}

/// `POST /peer/<method>` dispatch into the same ingest paths as gossip.
struct NodePeerHandler {
    bridge: Arc<ConsensusBridge>,
}

#[async_trait]
impl PeerHandler for NodePeerHandler {
    async fn handle(&self, method: &str, params: Value, _remote: SocketAddr) -> Result<Value> {
        match method {
            "propose" => {
                let envelope =
                    GossipEnvelope { topic: TOPIC_PROPOSE.into(), recursive: 1, payload: params };
                self.bridge.ingest_propose(envelope).await;
                Ok(json!({ "success": true }))
            }
            "votes" => {
                let envelope =
                    GossipEnvelope { topic: TOPIC_VOTES.into(), recursive: 1, payload: params };
                self.bridge.ingest_votes(envelope).await;
                Ok(json!({ "success": true }))
            }
            other => anyhow::bail!("unknown peer method {}", other),
        }
    }
}
