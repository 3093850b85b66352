//! Crypto module: key management, signing, verification, digests.
//!
//! - Keys: Ed25519 keypair generation and raw-byte public keys
//! - Sign: Ed25519 signatures over 32-byte digests
//! - Hash: SHA-256 and RIPEMD-160 (node identity)

pub mod hash;
pub mod keys;
pub mod sign;

pub use hash::{ripemd160, sha256};
pub use keys::{Keypair, PublicKey};
pub use sign::{Signature, Signer, Verifier};
