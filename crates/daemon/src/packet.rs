//! Handshake packet codec.
//!
//! Every datagram carries a fixed 20-byte header followed by a payload of
//! 32-bit words. All header fields and payload words are serialized
//! explicitly in little-endian so the wire format is identical on every
//! platform.
//!
//! ```text
//! offset  size  field
//!   0      4    magic        = 0x0E45474F
//!   4      4    type         1 = R1, 2 = R2, 3 = Confirm
//!   8      4    sequence     = policy_id
//!  12      4    timestamp    sender monotonic ms, informational
//!  16      4    payload_len  count of 32-bit words
//!  20    4*N    payload
//! ```

use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{NegotioError, Result};

/// Packet identification constant.
pub const MAGIC: u32 = 0x0E45_474F;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Size of a handshake nonce in bytes.
pub const NONCE_SIZE: usize = 32;

/// A nonce expressed in payload words.
pub const NONCE_WORDS: usize = NONCE_SIZE / 4;

/// The three packet types of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    /// Initiator nonce.
    R1 = 1,
    /// Responder nonce.
    R2 = 2,
    /// Completion signal, empty payload.
    Confirm = 3,
}

impl PacketType {
    /// Parse the wire tag; `None` for unrecognized values.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(PacketType::R1),
            2 => Some(PacketType::R2),
            3 => Some(PacketType::Confirm),
            _ => None,
        }
    }
}

/// A decoded negotiation packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Carries the policy id.
    pub sequence: u32,
    /// Sender monotonic milliseconds, informational only.
    pub timestamp: u32,
    /// Payload as 32-bit words.
    pub payload: Vec<u32>,
}

impl Packet {
    /// Build a packet from payload bytes, stamping the current monotonic
    /// time. Trailing bytes that do not fill a whole word are dropped;
    /// handshake payloads are always word-aligned.
    pub fn new(packet_type: PacketType, policy_id: u32, payload: &[u8]) -> Self {
        let words = payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self {
            packet_type,
            sequence: policy_id,
            timestamp: monotonic_ms(),
            payload: words,
        }
    }

    /// Payload re-expressed as bytes in wire order.
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payload.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// The leading 32 payload bytes, if present.
    pub fn nonce(&self) -> Option<[u8; NONCE_SIZE]> {
        if self.payload.len() < NONCE_WORDS {
            return None;
        }
        let mut nonce = [0u8; NONCE_SIZE];
        for (chunk, word) in nonce.chunks_exact_mut(4).zip(&self.payload) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Some(nonce)
    }

    /// Serialize into `buf`, which is cleared first.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(HEADER_SIZE + self.payload.len() * 4);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&(self.packet_type as u32).to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        for word in &self.payload {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }

    /// Serialize to a fresh buffer of `HEADER_SIZE + 4 * payload_len` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Parse a received datagram.
    ///
    /// Rejects short buffers, a wrong magic, an unknown type, a tail that is
    /// not a whole number of words, and a `payload_len` that disagrees with
    /// the datagram size. Never panics and never reads past `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NegotioError::InvalidParameter);
        }
        if read_u32(buf, 0) != MAGIC {
            return Err(NegotioError::InvalidParameter);
        }
        let packet_type =
            PacketType::from_u32(read_u32(buf, 4)).ok_or(NegotioError::InvalidParameter)?;
        let sequence = read_u32(buf, 8);
        let timestamp = read_u32(buf, 12);
        let payload_len = read_u32(buf, 16);

        let tail = buf.len() - HEADER_SIZE;
        if tail % 4 != 0 {
            return Err(NegotioError::InvalidParameter);
        }
        if payload_len as usize != tail / 4 {
            return Err(NegotioError::InvalidParameter);
        }

        let payload = buf[HEADER_SIZE..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            packet_type,
            sequence,
            timestamp,
            payload,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Milliseconds since process start, from the monotonic clock.
pub fn monotonic_ms() -> u32 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u32
}
