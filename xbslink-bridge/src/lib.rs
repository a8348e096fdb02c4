//! Bridge runtime for xbslink-ng.
//!
//! - `bridge`: the session coordinator and its worker set
//! - `stats`: traffic counters, RTT window, display formatting
//! - `config`: the persisted `~/.xbslink-ng/config.json`
//! - `launcher`: component wiring, MAC resolution, deferred discovery

pub mod bridge;
pub mod config;
pub mod launcher;
pub mod stats;

pub use bridge::{Bridge, BridgeConfig, BridgeState};
pub use stats::Stats;
