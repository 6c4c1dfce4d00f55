//! # Packet
//!
//! The discrete unit of exchange on the wire.
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [OpCode(2)] [Number(1)] [Kind(1)] [Flags(1)] [Priority(1)]
//! [Checksum(4)] [Timestamp(8)] [Reserved(2)] [Payload(Length - 22)]
//! ```
//!
//! All multi-byte fields are little-endian. `Length` counts the whole frame,
//! header included, so an empty-payload frame is exactly 22 bytes. The
//! checksum is CRC-32 (IEEE reflected polynomial) over the payload bytes
//! only, recomputed on decode and never trusted from the wire for routing.
//!
//! Two header fields are normalized at construction: a zero `Number` becomes
//! `timestamp mod 256`, and a zero `Timestamp` becomes the current Unix
//! millisecond clock.

use crate::config::HEADER_SIZE;
use crate::error::{Error, Result};
use crate::utils::arena::{Payload, PayloadArena};
use crate::utils::time::unix_millis;
use bytes::{BufMut, BytesMut};

/// Header flag bits. Opaque to the core except where noted.
pub mod flags {
    /// Payload is compressed (application concern).
    pub const COMPRESSED: u8 = 0b0000_0001;
    /// Payload was encrypted by the connection's cipher binding.
    pub const ENCRYPTED: u8 = 0b0000_0010;
}

// Fixed header offsets.
const OFF_LENGTH: usize = 0;
const OFF_OPCODE: usize = 2;
const OFF_NUMBER: usize = 4;
const OFF_KIND: usize = 5;
const OFF_FLAGS: usize = 6;
const OFF_PRIORITY: usize = 7;
const OFF_CHECKSUM: usize = 8;
const OFF_TIMESTAMP: usize = 12;

/// A single framed message.
///
/// The payload is immutable after construction and owned by value; large
/// payloads ride on arena-managed storage (see
/// [`PayloadArena`](crate::utils::arena::PayloadArena)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Application routing key.
    pub opcode: u16,
    /// Sequence tag; never zero after construction.
    pub number: u8,
    /// Payload schema family, opaque to the core.
    pub kind: u8,
    /// Bitfield, see [`flags`].
    pub flags: u8,
    /// Scheduling hint.
    pub priority: u8,
    /// Unix milliseconds at construction (server clock).
    pub timestamp: i64,
    payload: Payload,
}

impl Packet {
    /// Construct a packet for `opcode` carrying `payload`.
    ///
    /// The timestamp is stamped from the server clock and the sequence tag
    /// derived from it; both can be overridden with the `with_` builders.
    pub fn new(opcode: u16, payload: impl Into<Payload>) -> Self {
        let timestamp = unix_millis();
        Self {
            opcode,
            number: derive_number(timestamp),
            kind: 0,
            flags: 0,
            priority: 0,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Override the sequence tag. Zero keeps the derived value.
    pub fn with_number(mut self, number: u8) -> Self {
        if number != 0 {
            self.number = number;
        }
        self
    }

    /// Set the payload schema family.
    pub fn with_kind(mut self, kind: u8) -> Self {
        self.kind = kind;
        self
    }

    /// Set the flag bits.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the payload, keeping every header field.
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Borrow the payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Total frame size on the wire, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// CRC-32 of the payload bytes, as written into the header.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }

    /// Serialize the frame into `dst`.
    ///
    /// Length and checksum are computed here; fails `Oversize` when the
    /// frame would exceed `max_frame_size`.
    pub fn encode_to(&self, dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
        let frame_len = self.frame_len();
        if frame_len > max_frame_size || frame_len > u16::MAX as usize {
            return Err(Error::Oversize {
                length: frame_len,
                max: max_frame_size.min(u16::MAX as usize),
            });
        }

        dst.reserve(frame_len);
        dst.put_u16_le(frame_len as u16);
        dst.put_u16_le(self.opcode);
        dst.put_u8(self.number);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u8(self.priority);
        dst.put_u32_le(self.checksum());
        dst.put_i64_le(self.timestamp);
        dst.put_u16_le(0); // reserved pad
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Serialize to a fresh buffer using the default frame ceiling.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode_to(&mut buf, crate::config::DEFAULT_MAX_PACKET_SIZE)?;
        Ok(buf.to_vec())
    }

    /// Decode one complete frame.
    ///
    /// `frame` must hold at least the declared length. The checksum is
    /// recomputed over the payload and compared before the packet is
    /// constructed; the payload is copied into arena-owned storage.
    pub fn decode(frame: &[u8], arena: &PayloadArena, max_frame_size: usize) -> Result<Self> {
        if frame.len() < 2 {
            return Err(Error::ShortFrame {
                declared: HEADER_SIZE,
                available: frame.len(),
            });
        }

        let declared = read_u16_le(frame, OFF_LENGTH) as usize;
        if declared < HEADER_SIZE {
            return Err(Error::ShortFrame {
                declared,
                available: frame.len(),
            });
        }
        if declared > max_frame_size {
            return Err(Error::Oversize {
                length: declared,
                max: max_frame_size,
            });
        }
        if frame.len() < declared {
            return Err(Error::ShortFrame {
                declared,
                available: frame.len(),
            });
        }

        let payload_bytes = &frame[HEADER_SIZE..declared];
        let expected = read_u32_le(frame, OFF_CHECKSUM);
        let actual = crc32fast::hash(payload_bytes);
        if expected != actual {
            return Err(Error::Integrity { expected, actual });
        }

        let mut timestamp = read_i64_le(frame, OFF_TIMESTAMP);
        if timestamp == 0 {
            timestamp = unix_millis();
        }
        let mut number = frame[OFF_NUMBER];
        if number == 0 {
            number = derive_number(timestamp);
        }

        Ok(Self {
            opcode: read_u16_le(frame, OFF_OPCODE),
            number,
            kind: frame[OFF_KIND],
            flags: frame[OFF_FLAGS],
            priority: frame[OFF_PRIORITY],
            timestamp,
            payload: arena.acquire(payload_bytes),
        })
    }

    /// Decode from a standalone buffer with default limits. Test and tool
    /// convenience; the hot path goes through the codec with a shared arena.
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        let arena = PayloadArena::default();
        Self::decode(frame, &arena, crate::config::DEFAULT_MAX_PACKET_SIZE)
    }
}

/// Sequence tag substituted for zero: the timestamp modulo 256.
fn derive_number(timestamp: i64) -> u8 {
    timestamp.rem_euclid(256) as u8
}

fn read_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64_le(buf: &[u8], off: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_22_bytes() {
        let packet = Packet::new(0x0001, Vec::new());
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[22, 0]);
    }

    #[test]
    fn hello_frame_matches_wire_layout() {
        let packet = Packet::new(0x0001, b"hello".as_slice()).with_number(7);
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(bytes.len(), 27);
        assert_eq!(bytes[0], 0x1B);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(read_u16_le(&bytes, OFF_OPCODE), 0x0001);
        assert_eq!(bytes[OFF_NUMBER], 7);
        assert_eq!(read_u32_le(&bytes, OFF_CHECKSUM), 0x3610_A686);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let packet = Packet::new(0x00AB, b"payload".as_slice())
            .with_number(9)
            .with_kind(3)
            .with_flags(flags::COMPRESSED)
            .with_priority(2);
        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn zero_number_is_substituted() {
        let packet = Packet::new(0x0001, Vec::new());
        assert_eq!(packet.number, derive_number(packet.timestamp));
        // Overriding with zero keeps the derived tag.
        let derived = packet.number;
        assert_eq!(packet.with_number(0).number, derived);
    }

    #[test]
    fn corrupted_payload_fails_integrity() {
        let packet = Packet::new(0x0001, b"hello".as_slice());
        let mut bytes = packet.to_bytes().unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn short_declared_length_rejected() {
        let packet = Packet::new(0x0001, Vec::new());
        let mut bytes = packet.to_bytes().unwrap();
        bytes[0] = 10; // declare less than the header size
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::ShortFrame { declared: 10, .. })
        ));
    }

    #[test]
    fn oversize_encode_rejected() {
        let packet = Packet::new(0x0001, vec![0u8; crate::config::DEFAULT_MAX_PACKET_SIZE]);
        assert!(matches!(
            packet.to_bytes(),
            Err(Error::Oversize { .. })
        ));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let packet = Packet::new(0x0042, Vec::new());
        let bytes = packet.to_bytes().unwrap();
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert!(decoded.payload().is_empty());
        // CRC of the empty byte sequence.
        assert_eq!(read_u32_le(&bytes, OFF_CHECKSUM), 0);
        assert_eq!(decoded.checksum(), 0);
    }
}
