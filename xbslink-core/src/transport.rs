//! UDP transport with connection handling.
//!
//! One [`Transport`] owns one UDP socket for its whole lifetime. In listen
//! mode it waits for a valid HELLO and adopts the sender as its peer; in
//! connect mode it drives the HELLO / HELLO_ACK handshake, retrying forever
//! with exponential backoff. After the handshake the peer address is pinned:
//! datagrams from any other source are dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::{Codec, Message, ProtocolError};

/// Total time to wait for a HELLO_ACK after sending a HELLO.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cooperative read deadline. Cancellation is observed at this granularity.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// UDP receive buffer size for single-datagram reads.
pub const RECV_BUF_SIZE: usize = 65536;

/// Connect-mode retry backoff. The last entry repeats forever.
const CONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Transport operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Bind a port and wait for an incoming HELLO.
    Listen,
    /// Actively handshake with a remote peer.
    Connect,
}

/// Errors returned by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("peer address required in connect mode")]
    MissingPeerAddr,

    #[error("failed to resolve peer address {0:?}")]
    UnresolvableAddr(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("challenge response rejected (wrong pre-shared key?)")]
    ChallengeInvalid,

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub mode: Mode,
    /// Port to bind. In connect mode 0 selects an ephemeral port.
    pub local_port: u16,
    /// Peer address in "host:port" form. Connect mode only.
    pub peer_addr: Option<String>,
}

/// UDP transport bound to one socket, speaking the xbslink protocol.
pub struct Transport {
    socket: UdpSocket,
    codec: Arc<Codec>,
    mode: Mode,
    peer_addr: RwLock<Option<SocketAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Transport {
    /// Binds the UDP socket per the configuration. In connect mode the peer
    /// address is resolved here; the handshake itself happens in
    /// [`Transport::connect`].
    pub async fn bind(cfg: TransportConfig, codec: Arc<Codec>) -> Result<Self, TransportError> {
        let peer = match cfg.mode {
            Mode::Listen => None,
            Mode::Connect => {
                let raw = cfg
                    .peer_addr
                    .as_deref()
                    .ok_or(TransportError::MissingPeerAddr)?;
                let addr = lookup_host(raw)
                    .await
                    .map_err(|_| TransportError::UnresolvableAddr(raw.to_string()))?
                    .next()
                    .ok_or_else(|| TransportError::UnresolvableAddr(raw.to_string()))?;
                Some(addr)
            }
        };

        let socket = UdpSocket::bind(("0.0.0.0", cfg.local_port)).await?;
        if let Some(addr) = peer {
            info!("Connecting to peer {} from {}", addr, socket.local_addr()?);
        } else {
            info!("Listening on UDP :{}", cfg.local_port);
        }

        Ok(Self {
            socket,
            codec,
            mode: cfg.mode,
            peer_addr: RwLock::new(peer),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Waits for an incoming connection (listen mode). Returns once a valid
    /// HELLO has been received and the HELLO_ACK sent.
    ///
    /// Any other decodable message is answered with BYE so a peer that lost
    /// its session detects the reset quickly.
    pub async fn wait_for_peer(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        debug_assert_eq!(self.mode, Mode::Listen);
        info!("Waiting for peer connection...");

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        loop {
            let (n, addr) = match self.recv_raw(&mut buf, stop).await? {
                Some(pair) => pair,
                None => continue,
            };

            let msg = match self.codec.decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(err) => {
                    self.log_decode_error(&err, addr);
                    continue;
                }
            };

            let Message::Hello { version, challenge } = msg else {
                // Signal that we need a fresh handshake.
                let bye = self.codec.encode_bye();
                let _ = self.socket.send_to(&bye, addr).await;
                debug!("Expected HELLO from {addr}, got {msg}, sent BYE");
                continue;
            };

            info!("Received HELLO from {addr} (version {version})");

            *self.peer_addr.write().expect("peer_addr lock") = Some(addr);

            // Fresh session: the peer's sender nonces restart.
            self.codec.reset_recv_nonce();

            let ack = self.codec.encode_hello_ack(&challenge);
            self.socket.send_to(&ack, addr).await?;

            self.connected.store(true, Ordering::Release);
            info!("Peer connected: {addr}");
            return Ok(());
        }
    }

    /// Establishes a connection to the peer (connect mode). Retries forever
    /// with 1s, 2s, 5s, 10s, 10s, ... backoff until cancelled.
    pub async fn connect(&self, stop: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
        debug_assert_eq!(self.mode, Mode::Connect);

        let mut attempt = 0usize;
        loop {
            if *stop.borrow() {
                return Err(TransportError::Cancelled);
            }

            match self.attempt_handshake(stop).await {
                Ok(()) => return Ok(()),
                Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                Err(err) => {
                    let delay = CONNECT_BACKOFF[attempt.min(CONNECT_BACKOFF.len() - 1)];
                    warn!(
                        "Connection attempt {} failed: {err}. Retrying in {delay:?}...",
                        attempt + 1
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return Err(TransportError::Cancelled);
                            }
                        }
                    }

                    attempt += 1;
                    self.codec.reset_recv_nonce();
                }
            }
        }
    }

    /// One handshake attempt: send HELLO, await a verified HELLO_ACK from
    /// the expected peer within [`HANDSHAKE_TIMEOUT`].
    async fn attempt_handshake(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let peer = self.peer_addr().ok_or(TransportError::NotConnected)?;

        let (hello, challenge) = self.codec.encode_hello();
        debug!("Sending HELLO to {peer}");
        self.socket.send_to(&hello, peer).await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        while Instant::now() < deadline {
            let (n, addr) = match self.recv_raw(&mut buf, stop).await? {
                Some(pair) => pair,
                None => continue,
            };

            if addr != peer {
                debug!("Received packet from unexpected source {addr}");
                continue;
            }

            let msg = match self.codec.decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(err) => {
                    self.log_decode_error(&err, addr);
                    continue;
                }
            };

            let Message::HelloAck { response, .. } = msg else {
                debug!("Expected HELLO_ACK, got {msg}");
                continue;
            };

            if self.codec.is_keyed() {
                if !self.codec.verify_challenge_response(&challenge, &response) {
                    return Err(TransportError::ChallengeInvalid);
                }
                debug!("Challenge-response verified");
            }

            // Fresh session on both sides.
            self.codec.reset_recv_nonce();

            self.connected.store(true, Ordering::Release);
            info!("Connected to peer: {peer}");
            return Ok(());
        }

        Err(TransportError::HandshakeTimeout(HANDSHAKE_TIMEOUT))
    }

    /// One cooperative read: at most [`READ_TIMEOUT`] in the socket, checking
    /// the stop channel concurrently. `Ok(None)` means the deadline passed.
    async fn recv_raw(
        &self,
        buf: &mut [u8],
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Err(TransportError::Cancelled);
                }
                Ok(None)
            }
            res = tokio::time::timeout(READ_TIMEOUT, self.socket.recv_from(buf)) => {
                match res {
                    Ok(Ok((n, addr))) => Ok(Some((n, addr))),
                    Ok(Err(err)) => Err(err.into()),
                    Err(_elapsed) => Ok(None),
                }
            }
        }
    }

    fn log_decode_error(&self, err: &ProtocolError, addr: SocketAddr) {
        if matches!(err, ProtocolError::MessageTooShort) && self.codec.is_keyed() {
            warn!(
                "Received unreadable message from {addr} \
                 (pre-shared key mismatch? peer may not be using authentication)"
            );
        } else {
            debug!("Received invalid message from {addr}: {err}");
        }
    }

    /// Sends one datagram to the connected peer.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let peer = self.peer_addr().ok_or(TransportError::NotConnected)?;
        self.socket.send_to(data, peer).await?;
        Ok(())
    }

    /// Receives one datagram with a [`READ_TIMEOUT`] deadline. `Ok(None)`
    /// means the deadline passed without traffic; callers loop on this so
    /// cancellation checks stay frequent.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match tokio::time::timeout(READ_TIMEOUT, self.socket.recv_from(buf)).await {
            Ok(Ok((n, addr))) => Ok(Some((n, addr))),
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Sends a BYE to the peer. Best-effort: errors are swallowed.
    pub async fn send_bye(&self) {
        if !self.connected.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(peer) = self.peer_addr() {
            let bye = self.codec.encode_bye();
            let _ = self.socket.send_to(&bye, peer).await;
        }
    }

    /// Marks the transport closed. Idempotent; subsequent sends and receives
    /// fail with [`TransportError::Closed`]. The socket itself is released
    /// on drop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    /// True once a handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The pinned peer address, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.read().expect("peer_addr lock")
    }

    /// The local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
