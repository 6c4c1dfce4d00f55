//! Packet stream reader tests
//!
//! The codec must reassemble frames from arbitrarily fragmented input,
//! resynchronize after corrupt frames by discarding exactly one frame, and
//! treat bad length declarations as fatal.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::BytesMut;
use framewire::config::HEADER_SIZE;
use framewire::core::codec::{Frame, PacketCodec};
use framewire::core::packet::Packet;
use framewire::error::Error;
use tokio_util::codec::Decoder;

fn hello_packet() -> Packet {
    Packet::new(0x0001, b"hello".as_slice()).with_number(7)
}

#[test]
fn fragmented_frame_reassembles() {
    let mut codec = PacketCodec::default();
    let frame = hello_packet().to_bytes().unwrap();
    assert_eq!(frame.len(), 27);

    let mut buf = BytesMut::new();
    let fragments = [&frame[0..1], &frame[1..2], &frame[2..22], &frame[22..27]];

    // Every fragment but the last leaves the decoder suspended.
    for fragment in &fragments[..fragments.len() - 1] {
        buf.extend_from_slice(fragment);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }

    buf.extend_from_slice(fragments[fragments.len() - 1]);
    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Packet(packet)) => {
            assert_eq!(packet.opcode, 0x0001);
            assert_eq!(packet.number, 7);
            assert_eq!(packet.payload(), b"hello");
        }
        other => panic!("expected packet, got {other:?}"),
    }

    // Exactly one packet; the buffer is fully consumed.
    assert!(matches!(codec.decode(&mut buf), Ok(None)));
    assert!(buf.is_empty());
}

#[test]
fn byte_at_a_time_reassembles() {
    let mut codec = PacketCodec::default();
    let frame = hello_packet().to_bytes().unwrap();

    let mut buf = BytesMut::new();
    let mut yielded = 0;
    for &byte in &frame {
        buf.extend_from_slice(&[byte]);
        if let Some(Frame::Packet(_)) = codec.decode(&mut buf).unwrap() {
            yielded += 1;
        }
    }
    assert_eq!(yielded, 1);
}

#[test]
fn corrupt_frame_advances_buffer_and_stream_survives() {
    let mut codec = PacketCodec::default();

    let mut bad = hello_packet().to_bytes().unwrap();
    bad[HEADER_SIZE] ^= 0xFF; // flip first payload byte
    let good = Packet::new(0x0002, b"after".as_slice()).to_bytes().unwrap();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&bad);
    buf.extend_from_slice(&good);
    let total = buf.len();

    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Corrupt {
            opcode,
            length,
            expected,
            actual,
        }) => {
            assert_eq!(opcode, 0x0001);
            assert_eq!(length, 27);
            assert_eq!(expected, 0x3610_A686);
            assert_ne!(actual, expected);
        }
        other => panic!("expected corrupt frame, got {other:?}"),
    }

    // Buffer advanced by exactly the corrupt frame's declared length.
    assert_eq!(buf.len(), total - 27);

    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Packet(packet)) => assert_eq!(packet.opcode, 0x0002),
        other => panic!("expected packet, got {other:?}"),
    }
}

#[test]
fn length_below_header_is_fatal() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&[5u8, 0, 1, 2, 3][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(Error::ShortFrame { declared: 5, .. })
    ));
}

#[test]
fn length_above_max_is_fatal() {
    let max = 64;
    let mut codec = PacketCodec::new(max, std::sync::Arc::new(Default::default()));
    let declared = (max as u16 + 1).to_le_bytes();
    let mut buf = BytesMut::from(&declared[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(Error::Oversize { length, max: m }) if length == max + 1 && m == max
    ));
}

#[test]
fn several_packets_in_one_read_preserve_order() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    for opcode in 10..20u16 {
        buf.extend_from_slice(&Packet::new(opcode, vec![opcode as u8]).to_bytes().unwrap());
    }

    let mut seen = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        match frame {
            Frame::Packet(p) => seen.push(p.opcode),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(seen, (10..20u16).collect::<Vec<_>>());
}

#[test]
fn eof_with_partial_frame_is_short() {
    let mut codec = PacketCodec::default();
    let frame = hello_packet().to_bytes().unwrap();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&frame[..frame.len() - 3]);

    assert!(matches!(
        codec.decode_eof(&mut buf),
        Err(Error::ShortFrame {
            declared: 27,
            available: 24
        })
    ));
}

#[test]
fn eof_with_clean_buffer_is_quiet() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    assert!(matches!(codec.decode_eof(&mut buf), Ok(None)));
}
