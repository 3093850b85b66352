use serde::{Deserialize, Serialize};

use crate::network::node_id::{Contact, NodeId};

/// Topic fan-out envelope carried by Broadcast frames. `payload` is the
/// topic-specific JSON document; `recursive` is the remaining relay budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub topic: String,
    pub recursive: u8,
    pub payload: serde_json::Value,
}

/// Overlay wire frames. Encoded as length-delimited JSON; every frame
/// carries the sender's contact so receivers can refresh their tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Ping { from: Contact },
    Pong { from: Contact },
    FindNode { from: Contact, target: NodeId },
    Nodes { from: Contact, contacts: Vec<Contact> },
    Broadcast { from: Contact, envelope: GossipEnvelope },
}

impl WireMessage {
    pub fn sender(&self) -> &Contact {
        match self {
            WireMessage::Ping { from }
            | WireMessage::Pong { from }
            | WireMessage::FindNode { from, .. }
            | WireMessage::Nodes { from, .. }
            | WireMessage::Broadcast { from, .. } => from,
        }
    }
}
