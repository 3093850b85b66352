use ed25519_dalek::{Signature as DalekSig, Signer as DalekSigner, Verifier as DalekVerifier};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{Keypair, PublicKey};
use crate::utils::serde_helpers;

/// Raw 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_helpers::hex_array")] pub [u8; 64]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

/// Trait for signing digests.
pub trait Signer {
    fn sign(&self, msg: &[u8]) -> Signature;
}

/// Trait for verifying digests.
///
/// Verification never surfaces an error: malformed keys or signatures are
/// rejections, same as a wrong signature.
pub trait Verifier {
    fn verify(&self, msg: &[u8], sig: &Signature) -> bool;
}

impl Signer for Keypair {
    fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.dalek().sign(msg).to_bytes())
    }
}

impl Verifier for PublicKey {
    fn verify(&self, msg: &[u8], sig: &Signature) -> bool {
        let pk = match self.dalek() {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let ds = match DalekSig::try_from(&sig.0[..]) {
            Ok(ds) => ds,
            Err(_) => return false,
        };
        pk.verify(msg, &ds).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = Keypair::generate();
        let msg = b"vote digest bytes";
        let sig = kp.sign(msg);
        assert!(kp.public().verify(msg, &sig));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = kp.sign(b"message");
        assert!(!other.public().verify(b"message", &sig));
    }

    #[test]
    fn test_tampered_message_rejected() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"message");
        assert!(!kp.public().verify(b"messagf", &sig));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        let kp = Keypair::generate();
        assert!(!kp.public().verify(b"message", &Signature([0u8; 64])));
    }
}
