//! Kademlia-like overlay service: routing table upkeep, bootstrap, peer
//! persistence, periodic refresh and broadcast ingress.
//!
//! Overlay errors are logged and suppressed; nothing in here is allowed to
//! crash the consensus core. Broadcast frames leave the overlay through a
//! single [`BroadcastSink`] callback, the only edge the DHT knows about.

use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::network::codec::JsonCodec;
use crate::network::message::{GossipEnvelope, WireMessage};
use crate::network::node_id::{Contact, NodeId};
use crate::network::store::PeerStore;
use crate::network::table::{InsertOutcome, RoutingTable, BUCKET_SIZE};
use crate::utils::metrics::METRICS;

/// Flush the table to the peer store this often.
pub const SAVE_PEERS_INTERVAL: Duration = Duration::from_secs(60);
/// Re-query buckets that saw no traffic for this long.
pub const CHECK_BUCKET_OUTDATE: Duration = Duration::from_secs(180);
/// Re-insert missing bootstrap seeds this often.
pub const RECONNECT_SEED_INTERVAL: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REPLY_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("overlay io: {0}")]
    Io(#[from] std::io::Error),
    #[error("overlay request timed out")]
    Timeout,
    #[error("peer closed the connection")]
    Closed,
}

/// The gossip layer's ingress callback. Invoked for every accepted
/// Broadcast frame.
pub trait BroadcastSink: Send + Sync + 'static {
    fn on_broadcast(&self, envelope: GossipEnvelope, from: &Contact);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    Unreachable,
}

/// Overlay lifecycle events surfaced to the node wiring.
#[derive(Debug, Clone)]
pub enum DhtEvent {
    NodeAdded(Contact),
    NodeRemoved(NodeId, RemoveReason),
    PublicIpChanged { ip: String, port: u16, authoritative: bool },
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Advertised host (public IP).
    pub host: String,
    /// Overlay listen port; 0 binds an ephemeral port.
    pub port: u16,
    /// Static bootstrap seeds.
    pub seeds: Vec<(String, u16)>,
    /// Hosts whose frames are dropped on ingest and excluded from
    /// selection.
    pub black_list: HashSet<String>,
}

pub struct Dht {
    cfg: DhtConfig,
    table: Mutex<RoutingTable>,
    store: Option<PeerStore>,
    sink: std::sync::RwLock<Option<Arc<dyn BroadcastSink>>>,
    events: mpsc::UnboundedSender<DhtEvent>,
    self_contact: std::sync::RwLock<Contact>,
    listener: std::sync::Mutex<Option<TcpListener>>,
}

impl Dht {
    /// Bind the overlay listener and derive the node identity from the
    /// advertised `host` and the resolved port.
    pub async fn bind(
        cfg: DhtConfig,
        store: Option<PeerStore>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<DhtEvent>), DhtError> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port)).await?;
        let port = listener.local_addr()?.port();
        let self_contact = Contact::new(cfg.host.clone(), port);
        info!("overlay listening on port {} as {:?}", port, self_contact.id);

        let (events, events_rx) = mpsc::unbounded_channel();
        let dht = Arc::new(Self {
            table: Mutex::new(RoutingTable::new(self_contact.id)),
            store,
            sink: std::sync::RwLock::new(None),
            events,
            self_contact: std::sync::RwLock::new(self_contact),
            listener: std::sync::Mutex::new(Some(listener)),
            cfg,
        });
        Ok((dht, events_rx))
    }

    /// Install the broadcast ingress callback. Frames arriving before this
    /// is set are dropped.
    pub fn set_broadcast_sink(&self, sink: Arc<dyn BroadcastSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn self_contact(&self) -> Contact {
        self.self_contact.read().unwrap().clone()
    }

    pub fn seeds(&self) -> &[(String, u16)] {
        &self.cfg.seeds
    }

    /// Update the advertised address after external-IP discovery. The node
    /// identity is intentionally NOT re-derived; remote tables age the old
    /// entry out via `seen`.
    pub fn set_public_ip(&self, ip: &str, authoritative: bool) {
        let mut me = self.self_contact.write().unwrap();
        if me.host == ip {
            return;
        }
        info!("public ip changed {} -> {} (authoritative={})", me.host, ip, authoritative);
        me.host = ip.to_string();
        let port = me.port;
        drop(me);
        let _ = self.events.send(DhtEvent::PublicIpChanged {
            ip: ip.to_string(),
            port,
            authoritative,
        });
    }

    /// Spawn the overlay service: persisted-peer preload, accept loop,
    /// bootstrap, and the three periodic timers.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<anyhow::Result<()>>> {
        let mut handles = Vec::new();

        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => {
                warn!("overlay service already started; ignoring");
                return handles;
            }
        };

        // accept loop
        {
            let dht = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!("overlay accept loop shutting down");
                            return Ok(());
                        }
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer_addr)) => {
                                let dht = dht.clone();
                                tokio::spawn(async move {
                                    dht.handle_conn(stream, peer_addr).await;
                                });
                            }
                            Err(e) => {
                                warn!("overlay accept failed: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }));
        }

        // preload persisted peers, then join the seeds
        {
            let dht = self.clone();
            handles.push(tokio::spawn(async move {
                dht.preload_persisted().await;
                dht.bootstrap().await;
                Ok(())
            }));
        }

        // peer persistence
        if self.store.is_some() {
            let dht = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = interval(SAVE_PEERS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tick.tick() => dht.save_peers().await,
                    }
                }
            }));
        }

        // bucket refresh
        {
            let dht = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut tick = interval(CHECK_BUCKET_OUTDATE);
                tick.tick().await; // the table is fresh at startup
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tick.tick() => dht.refresh_stale_buckets().await,
                    }
                }
            }));
        }

        // seed reconnect
        {
            let dht = self.clone();
            let mut shutdown = shutdown;
            handles.push(tokio::spawn(async move {
                let mut tick = interval(RECONNECT_SEED_INTERVAL);
                tick.tick().await; // bootstrap already ran
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tick.tick() => dht.reconnect_missing_seeds().await,
                    }
                }
            }));
        }

        handles
    }

    async fn preload_persisted(&self) {
        let Some(store) = &self.store else { return };
        let persisted = store.load_all();
        let count = persisted.len();
        for contact in persisted {
            self.observe(contact).await;
        }
        if count > 0 {
            info!("preloaded {} persisted peers", count);
        }
    }

    async fn bootstrap(&self) {
        for (host, port) in self.cfg.seeds.clone() {
            self.join_seed(&host, port).await;
        }
    }

    async fn join_seed(&self, host: &str, port: u16) {
        let me = self.self_contact();
        if (host == me.host && port == me.port) || self.is_blacklisted(host) {
            return;
        }
        let ping = WireMessage::Ping { from: me.clone() };
        if let Err(e) = self.query(host, port, ping).await {
            debug!("seed {}:{} unreachable: {}", host, port, e);
            METRICS.inc("dht.seed_unreachable");
            return;
        }
        let find = WireMessage::FindNode { from: me.clone(), target: me.id };
        if let Err(e) = self.query(host, port, find).await {
            debug!("seed {}:{} lookup failed: {}", host, port, e);
        }
    }

    async fn reconnect_missing_seeds(&self) {
        let me = self.self_contact();
        for (host, port) in self.cfg.seeds.clone() {
            if host == me.host && port == me.port {
                continue;
            }
            let known = {
                let table = self.table.lock().await;
                table.contains(&NodeId::for_endpoint(&host, port))
            };
            if !known {
                debug!("re-joining missing seed {}:{}", host, port);
                self.join_seed(&host, port).await;
            }
        }
    }

    async fn refresh_stale_buckets(&self) {
        let stale = {
            let table = self.table.lock().await;
            table.stale_buckets(CHECK_BUCKET_OUTDATE)
        };
        for index in stale {
            let (target, queried) = {
                let mut table = self.table.lock().await;
                let target = table.random_id_in_bucket(index);
                table.mark_refreshed(index);
                (target, table.closest(&target, 3))
            };
            let me = self.self_contact();
            for contact in queried {
                let find = WireMessage::FindNode { from: me.clone(), target };
                if let Err(e) = self.query(&contact.host, contact.port, find).await {
                    debug!("bucket refresh query to {} failed: {}", contact.endpoint(), e);
                }
            }
        }
    }

    /// Snapshot the routing table into the peer store. Runs on the save
    /// timer and once more as the node's shutdown flush; a no-op without
    /// persistence.
    pub async fn save_peers(&self) {
        let Some(store) = &self.store else { return };
        let contacts = {
            let table = self.table.lock().await;
            table.contacts()
        };
        METRICS.set_gauge("dht.table_size", contacts.len() as f64);
        if let Err(e) = store.save(&contacts) {
            warn!("peer store save failed: {}", e);
            return;
        }
        if let Err(e) = store.flush().await {
            warn!("peer store flush failed: {}", e);
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let remote_host = peer_addr.ip().to_string();
        let mut framed = Framed::new(stream, JsonCodec::new());
        while let Some(frame) = framed.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("bad frame from {}: {}", remote_host, e);
                    METRICS.inc("dht.bad_frame");
                    return;
                }
            };
            if let Some(reply) = self.handle_message(msg, Some(&remote_host)).await {
                if let Err(e) = framed.send(reply).await {
                    debug!("reply to {} failed: {}", remote_host, e);
                    return;
                }
            }
        }
    }

    /// Process one inbound frame; the optional reply is sent on the same
    /// connection.
    pub async fn handle_message(
        &self,
        msg: WireMessage,
        remote_host: Option<&str>,
    ) -> Option<WireMessage> {
        let from = msg.sender().clone();
        if self.is_blacklisted(&from.host) || remote_host.map_or(false, |h| self.is_blacklisted(h)) {
            METRICS.inc("dht.blacklisted_drop");
            debug!("dropping frame from blacklisted host {}", from.host);
            return None;
        }
        self.observe(from.clone()).await;

        match msg {
            WireMessage::Ping { .. } => Some(WireMessage::Pong { from: self.self_contact() }),
            WireMessage::Pong { .. } => None,
            WireMessage::FindNode { target, .. } => {
                let contacts = {
                    let table = self.table.lock().await;
                    table.closest(&target, BUCKET_SIZE)
                };
                Some(WireMessage::Nodes { from: self.self_contact(), contacts })
            }
            WireMessage::Nodes { contacts, .. } => {
                for contact in contacts {
                    self.observe(contact).await;
                }
                None
            }
            WireMessage::Broadcast { envelope, .. } => {
                let sink = self.sink.read().unwrap().clone();
                match sink {
                    Some(sink) => sink.on_broadcast(envelope, &from),
                    None => debug!("broadcast before sink installed; dropped"),
                }
                None
            }
        }
    }

    /// Record a live contact in the table.
    async fn observe(&self, mut contact: Contact) {
        let me = self.self_contact();
        if contact.id == me.id || contact.endpoint() == me.endpoint() {
            return;
        }
        if self.is_blacklisted(&contact.host) {
            return;
        }
        contact.touch();
        let outcome = {
            let mut table = self.table.lock().await;
            table.insert(contact.clone())
        };
        if outcome == InsertOutcome::Added {
            METRICS.inc("dht.node_added");
            debug!("node added: {}", contact.endpoint());
            let _ = self.events.send(DhtEvent::NodeAdded(contact));
        }
    }

    fn is_blacklisted(&self, host: &str) -> bool {
        self.cfg.black_list.contains(host)
    }

    /// Live nodes minus blacklist minus self, deduplicated by endpoint.
    pub async fn healthy_nodes(&self) -> Vec<Contact> {
        let me = self.self_contact();
        let contacts = {
            let table = self.table.lock().await;
            table.contacts()
        };
        let mut seen = HashSet::new();
        contacts
            .into_iter()
            .filter(|c| c.endpoint() != me.endpoint() && !self.is_blacklisted(&c.host))
            .filter(|c| seen.insert(c.endpoint()))
            .collect()
    }

    /// Up to `n` healthy nodes sampled uniformly.
    pub async fn random_healthy(&self, n: usize) -> Vec<Contact> {
        let healthy = self.healthy_nodes().await;
        let mut rng = rand::thread_rng();
        healthy.choose_multiple(&mut rng, n).cloned().collect()
    }

    /// Connect, send one frame, await one reply. The reply is absorbed
    /// into the table before being returned.
    pub async fn query(&self, host: &str, port: u16, msg: WireMessage) -> Result<WireMessage, DhtError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| DhtError::Timeout)??;
        let mut framed = Framed::new(stream, JsonCodec::new());
        framed.send(msg).await?;
        let reply = timeout(REPLY_TIMEOUT, framed.next())
            .await
            .map_err(|_| DhtError::Timeout)?
            .ok_or(DhtError::Closed)??;
        self.handle_message(reply.clone(), Some(host)).await;
        Ok(reply)
    }

    /// Fire-and-forget one frame.
    async fn send_oneway(&self, contact: &Contact, msg: WireMessage) -> Result<(), DhtError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((contact.host.as_str(), contact.port)))
            .await
            .map_err(|_| DhtError::Timeout)??;
        let mut framed = Framed::new(stream, JsonCodec::new());
        framed.send(msg).await?;
        Ok(())
    }

    /// One-hop fanout of a gossip envelope. Unreachable peers are dropped
    /// from the table.
    pub async fn broadcast_to(self: &Arc<Self>, peers: &[Contact], envelope: GossipEnvelope) {
        let me = self.self_contact();
        for peer in peers {
            let dht = self.clone();
            let msg = WireMessage::Broadcast { from: me.clone(), envelope: envelope.clone() };
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = dht.send_oneway(&peer, msg).await {
                    debug!("broadcast to {} failed: {}", peer.endpoint(), e);
                    METRICS.inc("dht.broadcast_failed");
                    dht.remove_unreachable(&peer).await;
                }
            });
        }
    }

    async fn remove_unreachable(&self, contact: &Contact) {
        let removed = {
            let mut table = self.table.lock().await;
            table.remove(&contact.id)
        };
        if removed.is_some() {
            debug!("node removed (unreachable): {}", contact.endpoint());
            METRICS.inc("dht.node_removed");
            let _ = self
                .events
                .send(DhtEvent::NodeRemoved(contact.id, RemoveReason::Unreachable));
        }
    }

    pub async fn table_len(&self) -> usize {
        self.table.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str) -> DhtConfig {
        DhtConfig { host: host.into(), port: 0, seeds: vec![], black_list: HashSet::new() }
    }

    #[tokio::test]
    async fn test_bind_resolves_port_and_identity() {
        let (dht, _events) = Dht::bind(config("127.0.0.1"), None).await.unwrap();
        let me = dht.self_contact();
        assert_ne!(me.port, 0);
        assert_eq!(me.id, NodeId::for_endpoint("127.0.0.1", me.port));
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_contact_recorded() {
        let (dht, mut events) = Dht::bind(config("127.0.0.1"), None).await.unwrap();
        let remote = Contact::new("10.0.0.9", 7100);
        let reply = dht
            .handle_message(WireMessage::Ping { from: remote.clone() }, None)
            .await;
        assert!(matches!(reply, Some(WireMessage::Pong { .. })));
        assert_eq!(dht.table_len().await, 1);
        match events.try_recv().unwrap() {
            DhtEvent::NodeAdded(contact) => assert_eq!(contact.id, remote.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blacklisted_host_is_dropped() {
        let mut cfg = config("127.0.0.1");
        cfg.black_list.insert("10.0.0.9".into());
        let (dht, _events) = Dht::bind(cfg, None).await.unwrap();
        let reply = dht
            .handle_message(WireMessage::Ping { from: Contact::new("10.0.0.9", 7100) }, None)
            .await;
        assert!(reply.is_none());
        assert_eq!(dht.table_len().await, 0);
    }

    #[tokio::test]
    async fn test_find_node_returns_closest() {
        let (dht, _events) = Dht::bind(config("127.0.0.1"), None).await.unwrap();
        for i in 1..=5u16 {
            let nodes = WireMessage::Nodes {
                from: Contact::new("10.0.0.1", 7000 + i),
                contacts: vec![Contact::new("10.0.1.1", 8000 + i)],
            };
            dht.handle_message(nodes, None).await;
        }
        let target = NodeId::for_endpoint("10.0.1.1", 8001);
        let reply = dht
            .handle_message(
                WireMessage::FindNode { from: Contact::new("10.0.0.2", 7000), target },
                None,
            )
            .await;
        match reply {
            Some(WireMessage::Nodes { contacts, .. }) => {
                assert!(!contacts.is_empty());
                assert_eq!(contacts[0].id, target);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_frames_never_enter_table() {
        let (dht, _events) = Dht::bind(config("127.0.0.1"), None).await.unwrap();
        let me = dht.self_contact();
        dht.handle_message(WireMessage::Ping { from: me }, None).await;
        assert_eq!(dht.table_len().await, 0);
    }

    #[tokio::test]
    async fn test_healthy_excludes_blacklist_and_self() {
        let mut cfg = config("127.0.0.1");
        cfg.black_list.insert("10.9.9.9".into());
        let (dht, _events) = Dht::bind(cfg, None).await.unwrap();
        dht.handle_message(WireMessage::Ping { from: Contact::new("10.0.0.1", 7100) }, None).await;
        // blacklist check happens on ingest too, so inject via Nodes from a
        // clean host
        let nodes = WireMessage::Nodes {
            from: Contact::new("10.0.0.2", 7100),
            contacts: vec![Contact::new("10.9.9.9", 7100)],
        };
        dht.handle_message(nodes, None).await;
        let healthy = dht.healthy_nodes().await;
        let hosts: Vec<&str> = healthy.iter().map(|c| c.host.as_str()).collect();
        assert!(hosts.contains(&"10.0.0.1"));
        assert!(hosts.contains(&"10.0.0.2"));
        assert!(!hosts.contains(&"10.9.9.9"));
    }

    #[tokio::test]
    async fn test_public_ip_change_keeps_identity() {
        let (dht, mut events) = Dht::bind(config("127.0.0.1"), None).await.unwrap();
        let before = dht.self_contact();
        dht.set_public_ip("203.0.113.5", true);
        let after = dht.self_contact();
        assert_eq!(after.host, "203.0.113.5");
        assert_eq!(after.id, before.id);
        match events.try_recv().unwrap() {
            DhtEvent::PublicIpChanged { ip, authoritative, .. } => {
                assert_eq!(ip, "203.0.113.5");
                assert!(authoritative);
            }
            other => panic!("unexpected event {:?}", other),
        }
        // same ip again: no duplicate event
        dht.set_public_ip("203.0.113.5", true);
        assert!(events.try_recv().is_err());
    }
}
