//! Network module: DHT overlay, gossip fanout, peer RPC client and the
//! peer HTTP surface.
//!
//! Ownership runs downward: the gossip layer owns the DHT; the DHT only
//! sees a [`dht::BroadcastSink`] callback pointing back up.

pub mod codec;
pub mod dht;
pub mod gossip;
pub mod http;
pub mod message;
pub mod node_id;
pub mod peer_client;
pub mod store;
pub mod table;
pub mod version;

pub use dht::{Dht, DhtConfig, DhtEvent};
pub use gossip::Gossiper;
pub use message::{GossipEnvelope, WireMessage};
pub use node_id::{Contact, NodeId};
pub use peer_client::PeerClient;
pub use store::PeerStore;
