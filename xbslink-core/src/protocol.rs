//! Wire protocol for the xbslink-ng tunnel.
//!
//! Six message types travel over a single UDP association. When a pre-shared
//! key is configured every message is authenticated and replay-protected;
//! without a key only the type byte precedes the payload.
//!
//! # Wire Format
//!
//! Keyed mode:
//! - Type (1 byte)
//! - Nonce (8 bytes, big-endian, monotonically increasing per sender)
//! - Payload (variable)
//! - HMAC-SHA256 over Type+Nonce+Payload (32 bytes)
//!
//! Open mode:
//! - Type (1 byte)
//! - Payload (variable)
//!
//! All multi-byte integers are network byte order (big-endian).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Current protocol version, carried in HELLO and HELLO_ACK.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the per-message nonce in keyed mode.
pub const NONCE_SIZE: usize = 8;

/// HMAC-SHA256 output size.
pub const HMAC_SIZE: usize = 32;

/// Size of the random challenge carried in HELLO.
pub const CHALLENGE_SIZE: usize = 16;

/// Size of the challenge response carried in HELLO_ACK.
pub const CHALLENGE_RESPONSE_SIZE: usize = 32;

/// Minimum Ethernet frame size (header only).
pub const MIN_FRAME_SIZE: usize = 14;

/// Maximum Ethernet frame size.
pub const MAX_FRAME_SIZE: usize = 1514;

/// HELLO payload: version (2) + challenge (16).
pub const HELLO_PAYLOAD_SIZE: usize = 2 + CHALLENGE_SIZE;

/// HELLO_ACK payload: version (2) + response (32).
pub const HELLO_ACK_PAYLOAD_SIZE: usize = 2 + CHALLENGE_RESPONSE_SIZE;

/// PING/PONG payload: timestamp (8 bytes).
pub const PING_PAYLOAD_SIZE: usize = 8;

/// Smallest possible keyed datagram: type + nonce + HMAC.
pub const MIN_KEYED_SIZE: usize = 1 + NONCE_SIZE + HMAC_SIZE;

// Message type bytes.
const MSG_FRAME: u8 = 0x00;
const MSG_HELLO: u8 = 0x01;
const MSG_HELLO_ACK: u8 = 0x02;
const MSG_PING: u8 = 0x03;
const MSG_PONG: u8 = 0x04;
const MSG_BYE: u8 = 0x05;

/// Errors returned by codec operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too short")]
    MessageTooShort,

    #[error("invalid HMAC signature")]
    InvalidHmac,

    #[error("replay detected: nonce not increasing")]
    ReplayDetected,

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("invalid {kind} payload: {len} bytes")]
    InvalidPayload { kind: &'static str, len: usize },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("frame size {0} out of range [14, 1514]")]
    InvalidSize(usize),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw Ethernet frame, 14..=1514 bytes.
    Frame(Vec<u8>),
    /// Connection initiation with a random challenge.
    Hello {
        version: u16,
        challenge: [u8; CHALLENGE_SIZE],
    },
    /// Connection acceptance with the challenge response.
    HelloAck {
        version: u16,
        response: [u8; CHALLENGE_RESPONSE_SIZE],
    },
    /// Latency probe carrying the sender's timestamp in nanoseconds.
    Ping { timestamp: i64 },
    /// Latency response echoing the PING timestamp.
    Pong { timestamp: i64 },
    /// Graceful disconnect.
    Bye,
}

impl Message {
    /// Human-readable name of the message type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Frame(_) => "FRAME",
            Message::Hello { .. } => "HELLO",
            Message::HelloAck { .. } => "HELLO_ACK",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Bye => "BYE",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Stateful encoder/decoder for protocol messages.
///
/// With a key, outgoing messages carry a monotonically increasing nonce and
/// an HMAC-SHA256 signature, and incoming non-handshake messages must carry
/// a nonce strictly greater than any previously accepted one. Without a key
/// the codec operates in open mode: no nonce, no authentication.
///
/// A codec may be shared between tasks: the nonce counters are atomic and
/// everything else is immutable after construction.
pub struct Codec {
    key: Vec<u8>,
    send_nonce: AtomicU64,
    recv_nonce: AtomicU64,
}

impl Codec {
    /// Creates a codec. An empty key selects open mode.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            send_nonce: AtomicU64::new(0),
            recv_nonce: AtomicU64::new(0),
        }
    }

    /// Returns true when a pre-shared key is configured.
    pub fn is_keyed(&self) -> bool {
        !self.key.is_empty()
    }

    fn next_nonce(&self) -> u64 {
        self.send_nonce.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.key).expect("HMAC key length")
    }

    fn compute_hmac(&self, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn verify_hmac(&self, data: &[u8], sig: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(data);
        // Constant-time comparison.
        mac.verify_slice(sig).is_ok()
    }

    /// Lays out one wire message. Keyed: Type+Nonce+Payload+HMAC,
    /// open: Type+Payload.
    fn encode(&self, msg_type: u8, payload: &[u8]) -> Vec<u8> {
        if !self.is_keyed() {
            let mut msg = Vec::with_capacity(1 + payload.len());
            msg.push(msg_type);
            msg.extend_from_slice(payload);
            return msg;
        }

        let nonce = self.next_nonce();
        let mut msg = Vec::with_capacity(1 + NONCE_SIZE + payload.len() + HMAC_SIZE);
        msg.push(msg_type);
        msg.extend_from_slice(&nonce.to_be_bytes());
        msg.extend_from_slice(payload);

        let sig = self.compute_hmac(&msg);
        msg.extend_from_slice(&sig);
        msg
    }

    /// Encodes a raw Ethernet frame.
    pub fn encode_frame(&self, frame: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if frame.len() < MIN_FRAME_SIZE || frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::InvalidSize(frame.len()));
        }
        Ok(self.encode(MSG_FRAME, frame))
    }

    /// Encodes a HELLO message. Returns the wire bytes and the generated
    /// challenge, which the caller keeps to verify the matching HELLO_ACK.
    pub fn encode_hello(&self) -> (Vec<u8>, [u8; CHALLENGE_SIZE]) {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut challenge);

        let mut payload = [0u8; HELLO_PAYLOAD_SIZE];
        payload[0..2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        payload[2..].copy_from_slice(&challenge);

        (self.encode(MSG_HELLO, &payload), challenge)
    }

    /// Encodes a HELLO_ACK. The response is HMAC-SHA256(key, challenge) in
    /// keyed mode and all zeros in open mode.
    pub fn encode_hello_ack(&self, challenge: &[u8; CHALLENGE_SIZE]) -> Vec<u8> {
        let mut payload = [0u8; HELLO_ACK_PAYLOAD_SIZE];
        payload[0..2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        if self.is_keyed() {
            payload[2..].copy_from_slice(&self.compute_hmac(challenge));
        }
        self.encode(MSG_HELLO_ACK, &payload)
    }

    /// Encodes a PING carrying the given timestamp.
    pub fn encode_ping(&self, timestamp: i64) -> Vec<u8> {
        self.encode(MSG_PING, &timestamp.to_be_bytes())
    }

    /// Encodes a PONG echoing the given timestamp.
    pub fn encode_pong(&self, timestamp: i64) -> Vec<u8> {
        self.encode(MSG_PONG, &timestamp.to_be_bytes())
    }

    /// Encodes a BYE (no payload).
    pub fn encode_bye(&self) -> Vec<u8> {
        self.encode(MSG_BYE, &[])
    }

    /// Strips the framing: verifies the HMAC and the replay nonce in keyed
    /// mode, returns the raw type byte and payload.
    fn decode_framing<'a>(&self, data: &'a [u8]) -> Result<(u8, &'a [u8]), ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::MessageTooShort);
        }

        if !self.is_keyed() {
            return Ok((data[0], &data[1..]));
        }

        if data.len() < MIN_KEYED_SIZE {
            return Err(ProtocolError::MessageTooShort);
        }

        let msg_type = data[0];
        let nonce = u64::from_be_bytes(data[1..9].try_into().expect("nonce slice"));
        let signed_end = data.len() - HMAC_SIZE;
        let payload = &data[9..signed_end];
        let sig = &data[signed_end..];

        if !self.verify_hmac(&data[..signed_end], sig) {
            return Err(ProtocolError::InvalidHmac);
        }

        // Nonces must strictly increase for non-handshake traffic. HELLO and
        // HELLO_ACK are exempt so a peer whose sender counter restarted at 1
        // (process restart) can still re-handshake.
        if msg_type != MSG_HELLO && msg_type != MSG_HELLO_ACK && nonce > 0 {
            if nonce <= self.recv_nonce.load(Ordering::Acquire) {
                return Err(ProtocolError::ReplayDetected);
            }
            self.recv_nonce.store(nonce, Ordering::Release);
        }

        Ok((msg_type, payload))
    }

    /// Decodes one wire datagram into a [`Message`].
    pub fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        let (msg_type, payload) = self.decode_framing(data)?;

        match msg_type {
            MSG_FRAME => {
                if payload.len() < MIN_FRAME_SIZE || payload.len() > MAX_FRAME_SIZE {
                    return Err(ProtocolError::InvalidPayload {
                        kind: "FRAME",
                        len: payload.len(),
                    });
                }
                Ok(Message::Frame(payload.to_vec()))
            }

            MSG_HELLO => {
                if payload.len() < HELLO_PAYLOAD_SIZE {
                    return Err(ProtocolError::InvalidPayload {
                        kind: "HELLO",
                        len: payload.len(),
                    });
                }
                let version = u16::from_be_bytes(payload[0..2].try_into().expect("version"));
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        got: version,
                    });
                }
                let mut challenge = [0u8; CHALLENGE_SIZE];
                challenge.copy_from_slice(&payload[2..2 + CHALLENGE_SIZE]);
                Ok(Message::Hello { version, challenge })
            }

            MSG_HELLO_ACK => {
                if payload.len() < HELLO_ACK_PAYLOAD_SIZE {
                    return Err(ProtocolError::InvalidPayload {
                        kind: "HELLO_ACK",
                        len: payload.len(),
                    });
                }
                let version = u16::from_be_bytes(payload[0..2].try_into().expect("version"));
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        got: version,
                    });
                }
                let mut response = [0u8; CHALLENGE_RESPONSE_SIZE];
                response.copy_from_slice(&payload[2..2 + CHALLENGE_RESPONSE_SIZE]);
                Ok(Message::HelloAck { version, response })
            }

            MSG_PING | MSG_PONG => {
                if payload.len() < PING_PAYLOAD_SIZE {
                    return Err(ProtocolError::InvalidPayload {
                        kind: if msg_type == MSG_PING { "PING" } else { "PONG" },
                        len: payload.len(),
                    });
                }
                let timestamp =
                    i64::from_be_bytes(payload[0..PING_PAYLOAD_SIZE].try_into().expect("ts"));
                if msg_type == MSG_PING {
                    Ok(Message::Ping { timestamp })
                } else {
                    Ok(Message::Pong { timestamp })
                }
            }

            MSG_BYE => Ok(Message::Bye),

            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Verifies a HELLO_ACK challenge response in constant time.
    /// Always true in open mode.
    pub fn verify_challenge_response(&self, challenge: &[u8], response: &[u8]) -> bool {
        if !self.is_keyed() {
            return true;
        }
        if challenge.len() != CHALLENGE_SIZE || response.len() != CHALLENGE_RESPONSE_SIZE {
            return false;
        }
        let mut mac = self.mac();
        mac.update(challenge);
        mac.verify_slice(response).is_ok()
    }

    /// Resets the receive nonce for a new session. Called on each connect
    /// attempt and whenever a handshake completes, so a reconnecting peer is
    /// not rejected as a replay.
    pub fn reset_recv_nonce(&self) {
        self.recv_nonce.store(0, Ordering::Release);
    }

    #[cfg(test)]
    fn recv_nonce(&self) -> u64 {
        self.recv_nonce.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("keyed", &self.is_keyed())
            .field("send_nonce", &self.send_nonce.load(Ordering::Relaxed))
            .field("recv_nonce", &self.recv_nonce.load(Ordering::Relaxed))
            .finish()
    }
}
