//! Length-prefixed framed packet codec (spec §4.1).
//!
//! Plaintext wire format: `magic(4B) | type(2B) | length(4B) | crc32(4B) |
//! client_id(4B) | payload[length]`. All integers little-endian.

use crate::error::{AsciiChatError, Result};

/// Fixed sentinel identifying the protocol on the wire (clear-text even in
/// the encrypted variant, to support version negotiation).
pub const MAGIC: [u8; 4] = *b"ACH1";

/// Hard cap on a single packet's payload (16 MiB).
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    KeyExchangeInit = 1,
    KeyExchangeResponse = 2,
    AuthChallenge = 3,
    AuthResponse = 4,
    ServerAuthResponse = 5,
    HandshakeComplete = 6,
    AuthFailed = 7,
    ImageFrame = 8,
    AudioBatch = 9,
    TerminalSize = 10,
    ClientJoin = 11,
    ClientLeave = 12,
    Ping = 13,
    Pong = 14,
    AsciiFrame = 15,
    StreamStart = 16,
    StreamStop = 17,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::KeyExchangeInit,
            2 => Self::KeyExchangeResponse,
            3 => Self::AuthChallenge,
            4 => Self::AuthResponse,
            5 => Self::ServerAuthResponse,
            6 => Self::HandshakeComplete,
            7 => Self::AuthFailed,
            8 => Self::ImageFrame,
            9 => Self::AudioBatch,
            10 => Self::TerminalSize,
            11 => Self::ClientJoin,
            12 => Self::ClientLeave,
            13 => Self::Ping,
            14 => Self::Pong,
            15 => Self::AsciiFrame,
            16 => Self::StreamStart,
            17 => Self::StreamStop,
            _ => return None,
        })
    }

    /// Handshake packet types never carry the AEAD envelope (spec §4.2).
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::KeyExchangeInit
                | Self::KeyExchangeResponse
                | Self::AuthChallenge
                | Self::AuthResponse
                | Self::ServerAuthResponse
                | Self::HandshakeComplete
                | Self::AuthFailed
        )
    }
}

/// A decoded packet: type, originating/target client id, and payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub client_id: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, client_id: u32, payload: Vec<u8>) -> Self {
        Self { packet_type, client_id, payload }
    }

    /// Serialize to the plaintext wire format (header + crc32 + payload).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len as u64 > MAX_PAYLOAD as u64 {
            return Err(AsciiChatError::TooLarge(len as u32, MAX_PAYLOAD));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + len);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(self.packet_type as u16).to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        let crc = crc_over(self.client_id, &self.payload);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse a single packet from a buffer known to hold at least `header_len`
    /// bytes; returns the packet and how many bytes were consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return Err(AsciiChatError::Truncated { expected: HEADER_LEN, actual: buf.len() });
        }
        if buf[0..4] != MAGIC {
            return Err(AsciiChatError::BadMagic);
        }
        let type_raw = u16::from_le_bytes([buf[4], buf[5]]);
        let len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if len > MAX_PAYLOAD {
            return Err(AsciiChatError::TooLarge(len, MAX_PAYLOAD));
        }
        let crc_wire = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let client_id = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
        let total = HEADER_LEN + len as usize;
        if buf.len() < total {
            return Err(AsciiChatError::Truncated { expected: total, actual: buf.len() });
        }
        let payload = buf[HEADER_LEN..total].to_vec();
        let crc_computed = crc_over(client_id, &payload);
        if crc_wire != crc_computed {
            return Err(AsciiChatError::BadCrc);
        }
        let packet_type = PacketType::from_u16(type_raw).ok_or(AsciiChatError::UnknownType(type_raw))?;
        Ok((Packet { packet_type, client_id, payload }, total))
    }

    /// Serialize the `type | length | client_id | payload` body that gets
    /// sealed inside the AEAD envelope once a connection is `Ready` (spec
    /// §4.1 "Post-handshake, encrypted"). No magic, no crc32: the AEAD tag
    /// already authenticates this body, and the outer magic is the only
    /// clear-text byte on an encrypted connection.
    pub fn encode_sealed_body(&self) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if len as u64 > MAX_PAYLOAD as u64 {
            return Err(AsciiChatError::TooLarge(len as u32, MAX_PAYLOAD));
        }
        let mut out = Vec::with_capacity(2 + 4 + 4 + len);
        out.extend_from_slice(&(self.packet_type as u16).to_le_bytes());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Inverse of [`Self::encode_sealed_body`].
    pub fn decode_sealed_body(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(AsciiChatError::Truncated { expected: 10, actual: buf.len() });
        }
        let type_raw = u16::from_le_bytes([buf[0], buf[1]]);
        let len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        let client_id = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        if buf.len() != 10 + len {
            return Err(AsciiChatError::Truncated { expected: 10 + len, actual: buf.len() });
        }
        let packet_type = PacketType::from_u16(type_raw).ok_or(AsciiChatError::UnknownType(type_raw))?;
        Ok(Packet { packet_type, client_id, payload: buf[10..].to_vec() })
    }
}

fn crc_over(client_id: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&client_id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let pkt = Packet::new(PacketType::Ping, 42, vec![1, 2, 3, 4]);
        let bytes = pkt.encode().unwrap();
        let (decoded, consumed) = Packet::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.client_id, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.packet_type, PacketType::Ping);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let pkt = Packet::new(PacketType::Ping, 1, vec![]);
        let mut bytes = pkt.encode().unwrap();
        bytes[0] ^= 0xFF;
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, AsciiChatError::BadMagic));
        assert!(err.is_fatal());
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let pkt = Packet::new(PacketType::AudioBatch, 7, vec![9, 9, 9]);
        let mut bytes = pkt.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, AsciiChatError::BadCrc));
    }

    #[test]
    fn unknown_type_is_nonfatal() {
        let pkt = Packet::new(PacketType::Ping, 1, vec![]);
        let mut bytes = pkt.encode().unwrap();
        bytes[4] = 0xEE;
        bytes[5] = 0xEE;
        // Recompute nothing else; CRC is over client_id+payload so it still matches.
        let err = Packet::decode(&bytes).unwrap_err();
        assert!(matches!(err, AsciiChatError::UnknownType(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn truncated_header_reported() {
        let err = Packet::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, AsciiChatError::Truncated { .. }));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let pkt = Packet::new(PacketType::ImageFrame, 1, vec![0u8; (MAX_PAYLOAD + 1) as usize]);
        assert!(matches!(pkt.encode(), Err(AsciiChatError::TooLarge(_, _))));
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_payload_round_trips(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096), client_id in proptest::prelude::any::<u32>()) {
            let pkt = Packet::new(PacketType::ImageFrame, client_id, payload.clone());
            let bytes = pkt.encode().unwrap();
            let (decoded, consumed) = Packet::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(consumed, bytes.len());
            proptest::prop_assert_eq!(decoded.payload, payload);
            proptest::prop_assert_eq!(decoded.client_id, client_id);
        }
    }
}
