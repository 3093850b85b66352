//! Deterministic byte serializations of proposal and vote headers.
//!
//! Both layouts are big-endian. The caller snapshots the feature flags into
//! a [`ChainFlags`] before serializing so one hash operation always sees a
//! single flag state.

use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;
use thiserror::Error;

use crate::consensus::types::{ChainFlags, Height, Propose};
use crate::crypto::{sha256, PublicKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("block id `{0}` is not a decimal integer")]
    BadId(String),
    #[error("address `{0}` is not <ipv4>:<port>")]
    BadAddress(String),
    #[error("timestamp {0} does not fit the 4-byte wire field")]
    BadTimestamp(i64),
}

fn put_block_id(buf: &mut BytesMut, flags: ChainFlags, id: &str) -> Result<(), CodecError> {
    if flags.long_id {
        buf.put_slice(id.as_bytes());
    } else {
        let numeric: u64 = id.parse().map_err(|_| CodecError::BadId(id.to_string()))?;
        buf.put_u64(numeric);
    }
    Ok(())
}

/// Serialized vote header: height (8B signed BE) then the block id in the
/// active encoding.
pub fn vote_hash_bytes(flags: ChainFlags, height: Height, id: &str) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(8 + id.len().max(8));
    buf.put_i64(height as i64);
    put_block_id(&mut buf, flags, id)?;
    Ok(buf.to_vec())
}

/// 32-byte vote digest that delegate signatures cover.
pub fn vote_digest(flags: ChainFlags, height: Height, id: &str) -> Result<[u8; 32], CodecError> {
    Ok(sha256(&vote_hash_bytes(flags, height, id)?))
}

/// Serialized proposal header: height, id, generator key (32B raw),
/// timestamp (4B signed BE), IPv4 (4B BE), port (4B BE).
pub fn propose_hash_bytes(
    flags: ChainFlags,
    height: Height,
    id: &str,
    timestamp: i64,
    generator: &PublicKey,
    address: &str,
) -> Result<Vec<u8>, CodecError> {
    let endpoint: SocketAddrV4 = address
        .parse()
        .map_err(|_| CodecError::BadAddress(address.to_string()))?;
    let ts32 = i32::try_from(timestamp).map_err(|_| CodecError::BadTimestamp(timestamp))?;

    let mut buf = BytesMut::with_capacity(8 + id.len().max(8) + 32 + 12);
    buf.put_i64(height as i64);
    put_block_id(&mut buf, flags, id)?;
    buf.put_slice(generator.as_bytes());
    buf.put_i32(ts32);
    buf.put_u32(u32::from(*endpoint.ip()));
    buf.put_u32(endpoint.port() as u32);
    Ok(buf.to_vec())
}

/// 32-byte pre-PoW proposal digest.
pub fn propose_digest(
    flags: ChainFlags,
    height: Height,
    id: &str,
    timestamp: i64,
    generator: &PublicKey,
    address: &str,
) -> Result<[u8; 32], CodecError> {
    Ok(sha256(&propose_hash_bytes(flags, height, id, timestamp, generator, address)?))
}

/// Pre-PoW digest of a received proposal, from its own header fields.
pub fn propose_digest_of(flags: ChainFlags, propose: &Propose) -> Result<[u8; 32], CodecError> {
    propose_digest(
        flags,
        propose.height,
        &propose.id,
        propose.timestamp,
        &propose.generator_public_key,
        &propose.address,
    )
}
