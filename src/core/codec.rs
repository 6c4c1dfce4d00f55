//! # Packet Codec
//!
//! Tokio codec for framing packets over byte streams.
//!
//! The decoder tolerates arbitrary fragmentation: it suspends (returns
//! `Ok(None)`) until two length bytes are buffered, peeks the declared
//! frame length, then suspends again until the whole frame has arrived.
//! State lives entirely in the read buffer, so the reader is restartable
//! across suspensions and cancellation simply drops the buffer along with
//! any partial frame.
//!
//! ## Error disposition
//! - A declared length below the header size or above the configured
//!   maximum is a protocol violation that poisons the stream: the decoder
//!   returns the error and the connection closes.
//! - A CRC mismatch consumes the frame (resync by discarding, no byte
//!   scanning) and yields [`Frame::Corrupt`] so the connection survives.

use crate::config::HEADER_SIZE;
use crate::core::packet::Packet;
use crate::error::{Error, Result};
use crate::utils::arena::PayloadArena;
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// One decoded frame: either a validated packet or a consumed frame that
/// failed its integrity check.
#[derive(Debug)]
pub enum Frame {
    /// CRC-validated packet, ready for dispatch.
    Packet(Packet),
    /// Frame consumed from the stream but dropped for a CRC mismatch.
    Corrupt {
        opcode: u16,
        length: usize,
        expected: u32,
        actual: u32,
    },
}

/// Length-prefixed packet codec bound to a payload arena.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_frame_size: usize,
    arena: Arc<PayloadArena>,
}

impl PacketCodec {
    pub fn new(max_frame_size: usize, arena: Arc<PayloadArena>) -> Self {
        Self {
            max_frame_size,
            arena,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_PACKET_SIZE,
            Arc::new(PayloadArena::default()),
        )
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        // Suspend until the length prefix is visible.
        if src.len() < 2 {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([src[0], src[1]]) as usize;
        if declared < HEADER_SIZE {
            return Err(Error::ShortFrame {
                declared,
                available: src.len(),
            });
        }
        if declared > self.max_frame_size {
            return Err(Error::Oversize {
                length: declared,
                max: self.max_frame_size,
            });
        }

        // Suspend until the whole frame is buffered.
        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }

        let frame = src.split_to(declared);
        match Packet::decode(&frame, &self.arena, self.max_frame_size) {
            Ok(packet) => {
                trace!(
                    opcode = packet.opcode,
                    bytes = declared,
                    "Frame decoded"
                );
                Ok(Some(Frame::Packet(packet)))
            }
            Err(Error::Integrity { expected, actual }) => {
                // The frame is already consumed; the stream stays aligned.
                let opcode = u16::from_le_bytes([frame[2], frame[3]]);
                Ok(Some(Frame::Corrupt {
                    opcode,
                    length: declared,
                    expected,
                    actual,
                }))
            }
            Err(e) => Err(e),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                // The peer hung up mid-frame.
                let declared = if buf.len() >= 2 {
                    u16::from_le_bytes([buf[0], buf[1]]) as usize
                } else {
                    HEADER_SIZE
                };
                let available = buf.len();
                buf.advance(available);
                Err(Error::ShortFrame {
                    declared,
                    available,
                })
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        packet.encode_to(dst, self.max_frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::default()
    }

    #[test]
    fn decode_suspends_on_partial_input() {
        let mut codec = codec();
        let packet = Packet::new(0x0001, b"hello".as_slice()).with_number(7);
        let frame = packet.to_bytes().unwrap();

        // Nothing decodes until the final fragment arrives.
        let mut buf = BytesMut::new();
        for fragment in [&frame[0..1], &frame[1..2], &frame[2..22]] {
            buf.extend_from_slice(fragment);
            assert!(matches!(codec.decode(&mut buf), Ok(None)));
        }

        buf.extend_from_slice(&frame[22..27]);
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Packet(p)) => assert_eq!(p, packet),
            other => panic!("expected packet, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn corrupt_frame_consumed_and_reported() {
        let mut codec = codec();
        let packet = Packet::new(0x0001, b"hello".as_slice());
        let mut frame = packet.to_bytes().unwrap();
        frame[HEADER_SIZE] ^= 0xFF;

        let follow_up = Packet::new(0x0002, b"next".as_slice());
        let mut buf = BytesMut::from(frame.as_slice());
        buf.extend_from_slice(&follow_up.to_bytes().unwrap());

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Corrupt { opcode, length, .. }) => {
                assert_eq!(opcode, 0x0001);
                assert_eq!(length, 27);
            }
            other => panic!("expected corrupt frame, got {other:?}"),
        }

        // The buffer advanced past the bad frame; the next one decodes.
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Packet(p)) => assert_eq!(p.opcode, 0x0002),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn undersized_length_is_fatal() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&[10u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::ShortFrame { declared: 10, .. })
        ));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut codec = codec();
        let declared = (crate::config::DEFAULT_MAX_PACKET_SIZE + 1) as u16;
        let mut buf = BytesMut::from(declared.to_le_bytes().as_slice());
        assert!(matches!(codec.decode(&mut buf), Err(Error::Oversize { .. })));
    }

    #[test]
    fn eof_mid_frame_is_short() {
        let mut codec = codec();
        let packet = Packet::new(0x0001, b"hello".as_slice());
        let frame = packet.to_bytes().unwrap();
        let mut buf = BytesMut::from(&frame[..10]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(Error::ShortFrame { declared: 27, available: 10 })
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        for opcode in 1..=5u16 {
            codec
                .encode(Packet::new(opcode, vec![opcode as u8; 4]), &mut buf)
                .unwrap();
        }
        for opcode in 1..=5u16 {
            match codec.decode(&mut buf).unwrap() {
                Some(Frame::Packet(p)) => assert_eq!(p.opcode, opcode),
                other => panic!("expected packet, got {other:?}"),
            }
        }
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }
}
