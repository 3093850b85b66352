//! Slot clock: maps epoch-relative seconds to slot numbers and carries the
//! round parameters (delegate count, PoW leading bits, PoW timeout).

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid slot parameters: {0}")]
pub struct SlotParamsError(String);

#[derive(Debug, Clone)]
pub struct SlotClock {
    /// Unix seconds of the chain genesis.
    epoch_time: i64,
    /// Slot length in seconds.
    interval: i64,
    /// Active delegate set size.
    delegates: u32,
    /// PoW difficulty width (hex characters / masked bytes).
    leading: u8,
    pow_timeout: Duration,
}

impl SlotClock {
    pub fn new(
        epoch_time: i64,
        interval: i64,
        delegates: u32,
        leading: u8,
        pow_timeout: Duration,
    ) -> Result<Self, SlotParamsError> {
        if interval <= 0 {
            return Err(SlotParamsError("slot interval must be positive".into()));
        }
        if delegates == 0 {
            return Err(SlotParamsError("delegate set must not be empty".into()));
        }
        if !(1..=8).contains(&leading) {
            return Err(SlotParamsError("pow leading must be in 1..=8".into()));
        }
        if pow_timeout.is_zero() {
            return Err(SlotParamsError("pow timeout must be positive".into()));
        }
        Ok(Self { epoch_time, interval, delegates, leading, pow_timeout })
    }

    /// Slot number of an epoch-relative timestamp. Callers use slot
    /// equality as the "same round" predicate.
    pub fn slot_of(&self, ts: i64) -> i64 {
        ts.div_euclid(self.interval)
    }

    pub fn same_slot(&self, a: i64, b: i64) -> bool {
        self.slot_of(a) == self.slot_of(b)
    }

    /// Current epoch-relative time in seconds.
    pub fn epoch_now(&self) -> i64 {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        unix - self.epoch_time
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn delegates(&self) -> u32 {
        self.delegates
    }

    pub fn leading(&self) -> u8 {
        self.leading
    }

    pub fn pow_timeout(&self) -> Duration {
        self.pow_timeout
    }

    /// Strict lower bound for local finality: a vote set is sufficient when
    /// it holds MORE than this many signatures.
    pub fn vote_threshold(&self) -> usize {
        (2 * self.delegates as usize) / 3
    }
}
