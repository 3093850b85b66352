//! PoW worker pool: finds a nonce whose masked candidate hash carries the
//! required hex prefix, under a wall-clock deadline.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::pow::verify::{hex_prefix_matches, is_bit_string, pow_hash};

#[derive(Debug, Error)]
pub enum PowError {
    #[error("mining timed out after {0:?}")]
    Timeout(Duration),
    #[error("difficulty `{0}` is not a non-empty bit string")]
    BadDifficulty(String),
    #[error("miner worker pool terminated")]
    WorkerLost,
}

/// Worker-pool parameters, read from the fixed `config/miner-cfg.json`
/// contract path.
#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    /// Concurrent search threads.
    pub workers: usize,
    /// Nonces hashed between deadline/stop checks.
    pub batch: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self { workers: 4, batch: 4096 }
    }
}

impl MinerConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from("config/miner-cfg.json")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: MinerConfig = serde_json::from_str(&data)?;
        if cfg.workers == 0 || cfg.batch == 0 {
            anyhow::bail!("miner workers and batch must be positive");
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintResult {
    pub hash: [u8; 32],
    pub nonce: u64,
}

/// PoW oracle. `mint` blocks the calling thread for up to `timeout`; the
/// engine offloads it with `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct Miner {
    cfg: MinerConfig,
}

impl Miner {
    pub fn new(cfg: MinerConfig) -> Self {
        Self { cfg }
    }

    /// Load the worker-pool parameters from the contract path, falling back
    /// to defaults when the file is absent.
    pub fn from_config_file() -> anyhow::Result<Self> {
        let path = MinerConfig::default_path();
        if path.exists() {
            Ok(Self::new(MinerConfig::load(path)?))
        } else {
            debug!("no miner config at {}; using defaults", path.display());
            Ok(Self::new(MinerConfig::default()))
        }
    }

    /// Search for a nonce such that the masked candidate of
    /// `(src, nonce)` hex-starts with `difficulty`.
    ///
    /// Workers stride the nonce space and stop cooperatively on the first
    /// solution or when the deadline passes.
    pub fn mint(&self, src: &str, difficulty: &str, timeout: Duration) -> Result<MintResult, PowError> {
        if !is_bit_string(difficulty) {
            return Err(PowError::BadDifficulty(difficulty.to_string()));
        }
        let leading = difficulty.len() as u8;
        let deadline = Instant::now() + timeout;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<MintResult>();

        let workers = self.cfg.workers.max(1) as u64;
        let batch = self.cfg.batch.max(1);
        let mut handles = Vec::with_capacity(workers as usize);
        for offset in 0..workers {
            let src = src.to_string();
            let difficulty = difficulty.to_string();
            let stop = stop.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let mut nonce = offset;
                loop {
                    for _ in 0..batch {
                        let candidate = pow_hash(&src, nonce, leading);
                        if hex_prefix_matches(&candidate, &difficulty) {
                            stop.store(true, Ordering::SeqCst);
                            let _ = tx.send(MintResult { hash: candidate, nonce });
                            return;
                        }
                        nonce = nonce.wrapping_add(workers);
                    }
                    if stop.load(Ordering::SeqCst) || Instant::now() >= deadline {
                        return;
                    }
                }
            }));
        }
        drop(tx);

        let outcome = match rx.recv_timeout(timeout) {
            Ok(found) => Ok(found),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PowError::Timeout(timeout)),
            // all workers exited without a solution before the deadline
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(PowError::Timeout(timeout)),
        };
        stop.store(true, Ordering::SeqCst);
        for handle in handles {
            let _ = handle.join();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::verify::verify_pow;

    fn miner() -> Miner {
        Miner::new(MinerConfig { workers: 2, batch: 256 })
    }

    #[test]
    fn test_mint_finds_verifiable_solution() {
        // difficulty of length 2: ~64 expected attempts
        let src = "8d2f1e0a6c3b59741fe2";
        let minted = miner().mint(src, "10", Duration::from_secs(30)).unwrap();
        assert!(verify_pow(src, minted.nonce, &minted.hash, "10"));
    }

    #[test]
    fn test_mint_solutions_exist_for_short_difficulties() {
        for difficulty in ["0", "1", "01", "110", "1011"] {
            let minted = miner().mint("src-bytes", difficulty, Duration::from_secs(30)).unwrap();
            assert!(verify_pow("src-bytes", minted.nonce, &minted.hash, difficulty));
        }
    }

    #[test]
    fn test_mint_times_out_on_hard_difficulty() {
        // 16 nibbles => ~8^16 expected hashes, unreachable in 50ms
        let res = miner().mint("src", "0101010101010101", Duration::from_millis(50));
        assert!(matches!(res, Err(PowError::Timeout(_))));
    }

    #[test]
    fn test_mint_rejects_malformed_difficulty() {
        assert!(matches!(miner().mint("src", "", Duration::from_secs(1)), Err(PowError::BadDifficulty(_))));
        assert!(matches!(miner().mint("src", "10x", Duration::from_secs(1)), Err(PowError::BadDifficulty(_))));
    }
}
