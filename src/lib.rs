//! forgemesh: delegated proof-of-stake block-proposal consensus over a
//! Kademlia-style overlay.
//!
//! Public surface:
//! - consensus: slot clock, proposal/vote codec, delegate index, pending
//!   state and the consensus engine
//! - crypto: Ed25519 keys and signatures, SHA-256, RIPEMD-160
//! - pow: address-bound proof-of-work miner and verification
//! - network: DHT overlay, gossip fanout, peer RPC client, peer HTTP surface
//! - node: configuration, CLI, orchestration

pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;
pub mod pow;
pub mod utils;

#[cfg(test)]
mod tests;
