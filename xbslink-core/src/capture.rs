//! Packet capture and injection over libpcap.
//!
//! One [`Capture`] handle per bridge session, bound to a named interface
//! with a kernel-level BPF filter `ether src <xbox-mac>` so only frames from
//! the Xbox reach user space. Reads block in the kernel for at most 10 ms,
//! which keeps a pump thread responsive to shutdown.
//!
//! Capture requires elevated privileges on every platform; see
//! [`install_help`] for remediation text shown on failure.

use std::fmt;
use std::str::FromStr;

/// Maximum bytes captured per packet.
pub const SNAP_LEN: i32 = 65536;

/// Kernel-side read timeout in milliseconds.
pub const READ_TIMEOUT_MS: i32 = 10;

/// Capture buffer size.
pub const BUFFER_SIZE: i32 = 2 * 1024 * 1024;

/// Minimum writable Ethernet frame (header only).
pub const MIN_FRAME_SIZE: usize = 14;

/// Errors returned by capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("interface not found: {0:?}")]
    InterfaceNotFound(String),

    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),

    #[error("frame too small: {0} bytes")]
    FrameTooSmall(usize),

    #[error(transparent)]
    Pcap(#[from] pcap::Error),
}

/// A 6-byte Ethernet MAC address.
///
/// Parses `XX:XX:XX:XX:XX:XX` and `XX-XX-XX-XX-XX-XX`, case-insensitive.
/// Displays lowercase colon-separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True for broadcast/multicast addresses (I/G bit set). A device never
    /// sends from one of these.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddr {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(CaptureError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(CaptureError::InvalidMac(s.to_string()));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| CaptureError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Information about a capture-capable network interface.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// System name (e.g. "eth0", "en0", an NPF GUID on Windows).
    pub name: String,
    /// Human-readable description, when the platform provides one.
    pub description: String,
    /// Addresses assigned to the interface.
    pub addresses: Vec<String>,
}

/// Lists all capture-capable interfaces.
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, CaptureError> {
    let devices = pcap::Device::list()?;
    Ok(devices
        .into_iter()
        .map(|dev| InterfaceInfo {
            name: dev.name,
            description: dev.desc.unwrap_or_default(),
            addresses: dev.addresses.iter().map(|a| a.addr.to_string()).collect(),
        })
        .collect())
}

/// Finds an interface by exact name, case-insensitive name, or description
/// substring (useful on Windows, where names are NPF GUIDs).
pub fn find_interface(name: &str) -> Result<InterfaceInfo, CaptureError> {
    let interfaces = list_interfaces()?;

    if let Some(iface) = interfaces.iter().find(|i| i.name == name) {
        return Ok(iface.clone());
    }

    let lower = name.to_lowercase();
    if let Some(iface) = interfaces.iter().find(|i| i.name.to_lowercase() == lower) {
        return Ok(iface.clone());
    }

    if let Some(iface) = interfaces
        .iter()
        .find(|i| i.description.to_lowercase().contains(&lower))
    {
        return Ok(iface.clone());
    }

    Err(CaptureError::InterfaceNotFound(name.to_string()))
}

/// Formats the interface list for terminal display.
pub fn format_interface_list(interfaces: &[InterfaceInfo]) -> String {
    let mut out = String::from("Available network interfaces:\n\n");
    for (i, iface) in interfaces.iter().enumerate() {
        out.push_str(&format!("  {}. {}\n", i + 1, iface.name));
        if !iface.description.is_empty() {
            out.push_str(&format!("     Description: {}\n", iface.description));
        }
        if !iface.addresses.is_empty() {
            out.push_str(&format!("     Addresses:   {}\n", iface.addresses.join(", ")));
        }
        out.push('\n');
    }
    out
}

/// Platform-specific remediation text for missing capture support.
pub fn install_help() -> &'static str {
    if cfg!(target_os = "windows") {
        "Npcap is required for packet capture on Windows.\n\
         \n\
         To install Npcap:\n\
         1. Download from https://npcap.com/\n\
         2. Run the installer\n\
         3. IMPORTANT: Check \"Install Npcap in WinPcap API-compatible Mode\"\n\
         4. Restart this application\n\
         \n\
         If you have Npcap installed but still see this error:\n\
         - Make sure you installed with WinPcap compatibility mode\n\
         - Try running this application as Administrator"
    } else if cfg!(target_os = "macos") {
        "Packet capture requires root privileges on macOS.\n\
         \n\
         Try running with sudo:\n\
         \x20 sudo xbslink-ng [command] [flags]\n\
         \n\
         If you see \"Operation not permitted\", ensure your terminal has\n\
         Full Disk Access in System Preferences > Privacy & Security."
    } else if cfg!(target_os = "linux") {
        "Packet capture requires either root privileges or the pcap capability.\n\
         \n\
         Option 1: Run with sudo:\n\
         \x20 sudo xbslink-ng [command] [flags]\n\
         \n\
         Option 2: Add the capability to the binary:\n\
         \x20 sudo setcap cap_net_raw,cap_net_admin=eip /path/to/xbslink-ng\n\
         \n\
         If libpcap is not installed:\n\
         \x20 Debian/Ubuntu: sudo apt install libpcap-dev\n\
         \x20 Fedora/RHEL:   sudo dnf install libpcap-devel\n\
         \x20 Arch:          sudo pacman -S libpcap"
    } else {
        "Ensure libpcap is installed and you have permission to capture packets."
    }
}

/// Extracts (destination, source, EtherType) from an Ethernet frame, for
/// trace logging. Returns `None` below the minimum header size.
pub fn ethernet_summary(frame: &[u8]) -> Option<(MacAddr, MacAddr, u16)> {
    if frame.len() < MIN_FRAME_SIZE {
        return None;
    }
    let dst = MacAddr(frame[0..6].try_into().expect("dst mac"));
    let src = MacAddr(frame[6..12].try_into().expect("src mac"));
    let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    Some((dst, src, ether_type))
}

/// Human-readable name for common EtherTypes.
pub fn ether_type_name(ether_type: u16) -> String {
    match ether_type {
        0x0800 => "IPv4".to_string(),
        0x86DD => "IPv6".to_string(),
        0x0806 => "ARP".to_string(),
        other => format!("0x{other:04X}"),
    }
}

/// An active capture handle bound to one interface, filtered to one source
/// MAC in the kernel.
///
/// Reads and writes both require exclusive access; the bridge runs a single
/// pump thread that owns the handle for both directions.
pub struct Capture {
    handle: pcap::Capture<pcap::Active>,
    interface: String,
    xbox_mac: MacAddr,
}

impl Capture {
    /// Opens a capture on the given interface with the BPF filter
    /// `ether src <xbox_mac>`.
    pub fn open(interface: &str, xbox_mac: MacAddr) -> Result<Self, CaptureError> {
        let iface = find_interface(interface)?;
        tracing::debug!("Opening interface {} ({})", iface.name, iface.description);

        let mut handle = pcap::Capture::from_device(iface.name.as_str())?
            .snaplen(SNAP_LEN)
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .buffer_size(BUFFER_SIZE)
            .open()?;

        // Filtering in the kernel keeps non-Xbox traffic out of user space.
        let filter = format!("ether src {xbox_mac}");
        handle.filter(&filter, true)?;
        tracing::debug!("BPF filter set: {filter}");

        Ok(Self {
            handle,
            interface: iface.name,
            xbox_mac,
        })
    }

    /// Reads the next frame. `Ok(None)` means the kernel timeout expired
    /// with no packet. The returned frame is an owned copy, valid beyond the
    /// next read.
    pub fn read_packet(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.handle.next_packet() {
            Ok(packet) => {
                if packet.data.is_empty() {
                    return Ok(None);
                }
                Ok(Some(packet.data.to_vec()))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Injects one raw Ethernet frame onto the wire.
    pub fn write_packet(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        if frame.len() < MIN_FRAME_SIZE {
            return Err(CaptureError::FrameTooSmall(frame.len()));
        }
        self.handle.sendpacket(frame)?;
        Ok(())
    }

    /// Name of the capture interface.
    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// The filtered Xbox MAC.
    pub fn xbox_mac(&self) -> MacAddr {
        self.xbox_mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_colons() {
        let mac: MacAddr = "00:50:F2:1A:2B:3C".parse().expect("parse");
        assert_eq!(mac.octets(), [0x00, 0x50, 0xF2, 0x1A, 0x2B, 0x3C]);
    }

    #[test]
    fn parse_mac_dashes() {
        let mac: MacAddr = "00-50-F2-1A-2B-3C".parse().expect("parse");
        assert_eq!(mac.octets(), [0x00, 0x50, 0xF2, 0x1A, 0x2B, 0x3C]);
    }

    #[test]
    fn parse_mac_case_insensitive() {
        let lower: MacAddr = "aa:bb:cc:dd:ee:ff".parse().expect("parse");
        let mixed: MacAddr = "Aa:bB:CC:dd:EE:ff".parse().expect("parse");
        assert_eq!(lower, mixed);
    }

    #[test]
    fn parse_mac_rejects_bad_input() {
        for input in ["", "00:50:F2", "00:50:F2:1A:2B:3C:4D", "00:50:F2:1A:2B:ZZ", "0:50:F2:1A:2B:3C"] {
            assert!(
                input.parse::<MacAddr>().is_err(),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn mac_display_lowercase_colons() {
        let mac = MacAddr::new([0x00, 0x50, 0xF2, 0x1A, 0x2B, 0x3C]);
        assert_eq!(mac.to_string(), "00:50:f2:1a:2b:3c");
    }

    #[test]
    fn mac_multicast_bit() {
        assert!("ff:ff:ff:ff:ff:ff".parse::<MacAddr>().expect("parse").is_multicast());
        assert!("01:00:5e:00:00:01".parse::<MacAddr>().expect("parse").is_multicast());
        assert!(!"00:50:f2:1a:2b:3c".parse::<MacAddr>().expect("parse").is_multicast());
    }

    #[test]
    fn ethernet_summary_valid_frame() {
        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&[0xFF; 6]);
        frame[6..12].copy_from_slice(&[0x00, 0x50, 0xF2, 0xAA, 0xBB, 0xCC]);
        frame[12..14].copy_from_slice(&[0x08, 0x00]);

        let (dst, src, ether_type) = ethernet_summary(&frame).expect("summary");
        assert_eq!(dst.to_string(), "ff:ff:ff:ff:ff:ff");
        assert_eq!(src.to_string(), "00:50:f2:aa:bb:cc");
        assert_eq!(ether_type, 0x0800);
    }

    #[test]
    fn ethernet_summary_too_short() {
        assert!(ethernet_summary(&[0u8; 13]).is_none());
    }

    #[test]
    fn ether_type_names() {
        assert_eq!(ether_type_name(0x0800), "IPv4");
        assert_eq!(ether_type_name(0x86DD), "IPv6");
        assert_eq!(ether_type_name(0x0806), "ARP");
        assert_eq!(ether_type_name(0x88CC), "0x88CC");
    }

    #[test]
    fn format_interface_list_contains_entries() {
        let interfaces = vec![
            InterfaceInfo {
                name: "eth0".to_string(),
                description: "Primary NIC".to_string(),
                addresses: vec!["192.168.1.10".to_string()],
            },
            InterfaceInfo {
                name: "lo".to_string(),
                description: String::new(),
                addresses: vec![],
            },
        ];
        let out = format_interface_list(&interfaces);
        assert!(out.contains("1. eth0"));
        assert!(out.contains("Primary NIC"));
        assert!(out.contains("192.168.1.10"));
        assert!(out.contains("2. lo"));
    }

    #[test]
    fn install_help_not_empty() {
        assert!(!install_help().is_empty());
    }

    #[test]
    #[ignore] // Needs a real interface and capture privileges.
    fn open_capture_on_loopback() {
        let mac: MacAddr = "00:50:f2:1a:2b:3c".parse().expect("parse");
        match Capture::open("lo", mac) {
            Ok(cap) => assert_eq!(cap.xbox_mac(), mac),
            Err(err) => eprintln!("capture open failed (expected without privileges): {err}"),
        }
    }
}
