//! Node configuration: TOML file plus CLI overrides. Validation failures
//! are fatal at startup; a node never runs on a config it cannot trust.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consensus::slots::SlotClock;
use crate::crypto::{Keypair, PublicKey};
use crate::network::version::{MIN_VERSION_MAINNET, MIN_VERSION_TESTNET};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetVersion {
    Mainnet,
    Testnet,
}

impl NetVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetVersion::Mainnet => "mainnet",
            NetVersion::Testnet => "testnet",
        }
    }

    /// Minimum peer version admitted on this network.
    pub fn min_peer_version(&self) -> [u32; 3] {
        match self {
            NetVersion::Mainnet => MIN_VERSION_MAINNET,
            NetVersion::Testnet => MIN_VERSION_TESTNET,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeersConfig {
    /// Bootstrap seeds, `host:port`.
    #[serde(default)]
    pub list: Vec<String>,
    /// Hosts dropped on ingest and excluded from peer selection.
    #[serde(default)]
    pub black_list: Vec<String>,
    /// Persist the routing table across restarts.
    #[serde(default = "default_true")]
    pub persistent: bool,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self { list: Vec::new(), black_list: Vec::new(), persistent: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotsConfig {
    /// Unix seconds of the chain genesis.
    pub epoch_time: i64,
    /// Slot length in seconds.
    pub interval: i64,
    /// Active delegate set size.
    pub delegates: u32,
    /// PoW difficulty width.
    pub leading: u8,
    pub pow_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForgingConfig {
    /// Hex seeds of the delegate keys this node votes with.
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_public_ip")]
    pub public_ip: String,
    /// Overlay listen port; the peer HTTP surface binds one below it.
    pub peer_port: u16,
    /// Network magic echoed on every peer RPC.
    pub magic: String,
    pub net_version: NetVersion,
    pub data_dir: PathBuf,
    /// Discover the external address through a bootstrap peer.
    #[serde(default)]
    pub acquire_ip: bool,
    /// Block-id wire encoding: raw UTF-8 (true) or 8-byte decimal.
    #[serde(default = "default_true")]
    pub long_id: bool,
    #[serde(default)]
    pub peers: PeersConfig,
    pub slots: SlotsConfig,
    #[serde(default)]
    pub forging: ForgingConfig,
    /// Active delegate ring, hex public keys in network order.
    #[serde(default)]
    pub delegates: Vec<String>,
}

fn default_public_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let cfg: NodeConfig = toml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.magic.is_empty() {
            return Err(ConfigError::Invalid("magic must not be empty".into()));
        }
        if self.peer_port < 2 {
            return Err(ConfigError::Invalid(
                "peer_port must leave room for the http listener below it".into(),
            ));
        }
        self.slot_clock()?;
        self.seed_pairs()?;
        self.delegate_ring()?;
        self.forging_keypairs()?;
        Ok(())
    }

    pub fn slot_clock(&self) -> Result<SlotClock, ConfigError> {
        SlotClock::new(
            self.slots.epoch_time,
            self.slots.interval,
            self.slots.delegates,
            self.slots.leading,
            Duration::from_millis(self.slots.pow_timeout_ms),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn seed_pairs(&self) -> Result<Vec<(String, u16)>, ConfigError> {
        self.peers.list.iter().map(|s| parse_endpoint(s)).collect()
    }

    pub fn black_list_set(&self) -> HashSet<String> {
        self.peers.black_list.iter().cloned().collect()
    }

    pub fn delegate_ring(&self) -> Result<Vec<PublicKey>, ConfigError> {
        self.delegates
            .iter()
            .map(|s| {
                PublicKey::from_hex(s)
                    .map_err(|_| ConfigError::Invalid(format!("bad delegate key `{}`", s)))
            })
            .collect()
    }

    pub fn forging_keypairs(&self) -> Result<Vec<Keypair>, ConfigError> {
        self.forging
            .secrets
            .iter()
            .map(|s| {
                Keypair::from_secret_hex(s)
                    .map_err(|_| ConfigError::Invalid("bad forging secret".into()))
            })
            .collect()
    }

    /// Starter config written by `init`.
    pub fn template() -> &'static str {
        r#"public_ip = "127.0.0.1"
peer_port = 7100
magic = "594fe0f3"
net_version = "testnet"
data_dir = "./data"
acquire_ip = false
long_id = true
# active delegate ring, hex public keys in network order
delegates = []

[peers]
list = []
black_list = []
persistent = true

[slots]
epoch_time = 1640995200
interval = 10
delegates = 101
leading = 2
pow_timeout_ms = 4000

[forging]
secrets = []
"#
    }
}

fn parse_endpoint(s: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("seed `{}` is not host:port", s)))?;
    if host.is_empty() {
        return Err(ConfigError::Invalid(format!("seed `{}` has no host", s)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("seed `{}` has a bad port", s)))?;
    Ok((host.to_string(), port))
}
