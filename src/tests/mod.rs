//! Cross-module integration tests: overlay bring-up and a full proposal
//! round over loopback TCP.

mod consensus_round;
mod overlay;
