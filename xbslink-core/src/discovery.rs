//! Passive Xbox console discovery.
//!
//! System Link traffic uses UDP port 3074. Discovery opens a promiscuous
//! capture filtered to that port and returns the source MAC of the first
//! unicast frame it sees. No packets are ever transmitted.

use tokio::sync::watch;
use tracing::debug;

use crate::capture::{find_interface, CaptureError, MacAddr};

/// UDP port registered for Xbox System Link.
pub const SYSTEM_LINK_PORT: u16 = 3074;

/// Enough for Ethernet + IP + UDP headers; discovery only reads MACs.
pub const SNAP_LEN: i32 = 128;

/// Kernel-side read timeout. Cancellation is observed at this granularity.
pub const READ_TIMEOUT_MS: i32 = 100;

/// Errors returned by discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery cancelled")]
    Cancelled,

    #[error("discovery task failed")]
    TaskFailed,

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Listens for System Link traffic on the given interface and returns the
/// first unicast source MAC observed. Cancellable via the stop channel at
/// [`READ_TIMEOUT_MS`] granularity.
pub async fn discover(
    interface: String,
    stop: watch::Receiver<bool>,
) -> Result<MacAddr, DiscoveryError> {
    tokio::task::spawn_blocking(move || discover_blocking(&interface, stop))
        .await
        .map_err(|_| DiscoveryError::TaskFailed)?
}

fn discover_blocking(
    interface: &str,
    stop: watch::Receiver<bool>,
) -> Result<MacAddr, DiscoveryError> {
    let iface = find_interface(interface)?;

    let mut handle = pcap::Capture::from_device(iface.name.as_str())
        .map_err(CaptureError::from)?
        .snaplen(SNAP_LEN)
        .promisc(true)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .map_err(CaptureError::from)?;

    let filter = format!("udp port {SYSTEM_LINK_PORT}");
    handle.filter(&filter, true).map_err(CaptureError::from)?;

    debug!("Listening for Xbox System Link traffic (UDP port {SYSTEM_LINK_PORT})");

    loop {
        if *stop.borrow() {
            return Err(DiscoveryError::Cancelled);
        }

        let data = match handle.next_packet() {
            Ok(packet) => packet.data,
            // Timeouts and transient read errors both mean "keep listening".
            Err(_) => continue,
        };

        if data.len() < 14 {
            continue;
        }

        let src = MacAddr::new(data[6..12].try_into().expect("src mac"));
        if src.is_multicast() {
            continue;
        }

        return Ok(src);
    }
}
