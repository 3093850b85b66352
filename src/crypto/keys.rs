use anyhow::{anyhow, Result};
use ed25519_dalek::{Keypair as DalekKeypair, PublicKey as DalekPublic, SecretKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::serde_helpers;

/// Raw 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_helpers::hex_array")] pub [u8; 32]);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow!("public key must be 32 bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn dalek(&self) -> Result<DalekPublic> {
        DalekPublic::from_bytes(&self.0).map_err(|_| anyhow!("malformed public key"))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Ed25519 keypair wrapper. Secret material never leaves this type except
/// through `secret_bytes` (used for config-driven forging keys).
pub struct Keypair {
    inner: DalekKeypair,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self { inner: DalekKeypair::generate(&mut OsRng) }
    }

    /// Construct from a 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let sk = SecretKey::from_bytes(secret).map_err(|_| anyhow!("secret must be 32 bytes"))?;
        let pk = DalekPublic::from(&sk);
        Ok(Self { inner: DalekKeypair { secret: sk, public: pk } })
    }

    /// Construct from a hex-encoded 32-byte secret seed.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        Self::from_secret_bytes(&hex::decode(s)?)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.inner.public.to_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.inner.secret.to_bytes()
    }

    pub(crate) fn dalek(&self) -> &DalekKeypair {
        &self.inner
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        // dalek secret keys are not Clone; re-derive from the seed
        Self::from_secret_bytes(&self.secret_bytes()).expect("seed is always 32 bytes")
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public().to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_rebuild_from_seed() {
        let kp = Keypair::generate();
        let rebuilt = Keypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public(), rebuilt.public());
    }

    #[test]
    fn test_public_key_hex_round_trip() {
        let kp = Keypair::generate();
        let pk = kp.public();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);
    }

    #[test]
    fn test_rejects_short_secret() {
        assert!(Keypair::from_secret_bytes(&[1u8; 16]).is_err());
    }
}
