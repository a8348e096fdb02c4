//! Core library for the xbslink-ng System Link bridge.
//!
//! xbslink-ng tunnels Xbox System Link traffic between two physically
//! separated LANs over a single authenticated UDP association: raw Ethernet
//! frames from a designated console are captured on one side, carried as
//! protocol datagrams, and re-injected onto the wire on the other side.
//!
//! # Architecture
//!
//! - `protocol`: wire format, HMAC authentication, replay protection
//! - `transport`: UDP socket ownership, handshake, reconnection backoff
//! - `capture`: pcap-based frame capture and injection, interface lookup
//! - `discovery`: passive console detection on the System Link port
//! - `events`: fire-and-forget structured diagnostics
//!
//! The bridge coordinator that ties these together lives in the
//! `xbslink-bridge` crate.

pub mod capture;
pub mod discovery;
pub mod events;
pub mod protocol;
pub mod transport;

pub use capture::MacAddr;
pub use protocol::{Codec, Message, ProtocolError};
pub use transport::{Mode, Transport, TransportConfig};
