#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Comprehensive edge-case tests for production-grade reliability
//! Tests boundary conditions, error scenarios, resource limits, and concurrent edge cases

use bytes::BytesMut;
use framewire::config::{TransportConfig, HEADER_SIZE};
use framewire::core::codec::{Frame, PacketCodec};
use framewire::core::packet::Packet;
use framewire::core::serialization::FormatterRegistry;
use framewire::error::Error;
use framewire::utils::arena::{Payload, PayloadArena};
use std::sync::Arc;
use tokio_util::codec::Decoder;

// ============================================================================
// PACKET CODEC EDGE CASES
// ============================================================================

#[test]
fn test_empty_buffer_suspends() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    assert!(matches!(codec.decode(&mut buf), Ok(None)));
}

#[test]
fn test_single_byte_suspends() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&[0x1B][..]);
    assert!(matches!(codec.decode(&mut buf), Ok(None)));
}

#[test]
fn test_zero_length_declaration_fatal() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&[0u8, 0][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(Error::ShortFrame { declared: 0, .. })
    ));
}

#[test]
fn test_length_exactly_header_decodes_empty() {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&Packet::new(5, Vec::new()).to_bytes().unwrap());
    match codec.decode(&mut buf).unwrap() {
        Some(Frame::Packet(p)) => {
            assert_eq!(p.opcode, 5);
            assert!(p.payload().is_empty());
        }
        other => panic!("expected packet, got {other:?}"),
    }
}

#[test]
fn test_max_u16_length_rejected_by_default_codec() {
    // Declared length 0xFFFF exceeds the default 32 KiB ceiling.
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(&[0xFF, 0xFF][..]);
    assert!(matches!(codec.decode(&mut buf), Err(Error::Oversize { .. })));
}

#[test]
fn test_corrupt_empty_payload_frame() {
    // Corrupt the checksum of an empty-payload frame: consumed, reported,
    // stream continues.
    let mut codec = PacketCodec::default();
    let mut frame = Packet::new(1, Vec::new()).to_bytes().unwrap();
    frame[8] ^= 0x01;
    let mut buf = BytesMut::from(frame.as_slice());
    assert!(matches!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Corrupt { length: 22, .. })
    ));
    assert!(buf.is_empty());
}

// ============================================================================
// ARENA EDGE CASES
// ============================================================================

#[test]
fn test_arena_zero_byte_acquire() {
    let arena = PayloadArena::new(1024);
    let payload = arena.acquire(&[]);
    assert_eq!(payload.len(), 0);
    assert!(matches!(payload, Payload::Pooled(_)));
}

#[test]
fn test_arena_sweep_on_empty_registry() {
    let arena = PayloadArena::new(1024);
    assert_eq!(arena.sweep(), 0);
    assert_eq!(arena.sweep(), 0);
}

#[test]
fn test_arena_many_cycles_bounded() {
    let arena = PayloadArena::new(1024);
    for _ in 0..10_000 {
        let payload = arena.acquire(&[0xAB; 512]);
        assert_eq!(payload.len(), 512);
    }
    // Pool keeps at most one buffer alive from serial use.
    assert!(arena.pooled_available() <= 2);
}

#[test]
fn test_arena_heap_churn_reclaims_all() {
    let arena = PayloadArena::new(256);
    for _ in 0..100 {
        let _payload = arena.acquire(&vec![1u8; 4096]);
    }
    // Every holder is gone; one sweep reclaims the lot.
    assert_eq!(arena.sweep(), 100);
    assert_eq!(arena.registered_count(), 0);
}

#[tokio::test]
async fn test_arena_shared_across_tasks() {
    let arena = Arc::new(PayloadArena::new(1024));
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..32 {
        let arena = Arc::clone(&arena);
        tasks.spawn(async move {
            let payload = arena.acquire(&vec![i as u8; 700]);
            assert_eq!(payload.as_slice()[0], i as u8);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
}

// ============================================================================
// FORMATTER EDGE CASES
// ============================================================================

#[test]
fn test_empty_string_roundtrip() {
    let registry = FormatterRegistry::new();
    let mut out = BytesMut::new();
    registry.serialize(&String::new(), &mut out).unwrap();
    assert_eq!(&out[..], &[0, 0]);

    let mut input = out.freeze();
    let back: String = registry.deserialize(&mut input).unwrap();
    assert!(back.is_empty());
}

#[test]
fn test_string_count_but_no_bytes_fails() {
    let registry = FormatterRegistry::new();
    let mut input = bytes::Bytes::from(vec![10u8, 0, b'x']);
    let result: Result<String, _> = registry.deserialize(&mut input);
    assert!(matches!(result, Err(Error::ShortFrame { .. })));
}

#[test]
fn test_nullable_empty_input_fails() {
    let registry = FormatterRegistry::new();
    let mut input = bytes::Bytes::new();
    let result: Result<Option<u8>, _> = registry.deserialize(&mut input);
    assert!(matches!(result, Err(Error::ShortFrame { .. })));
}

#[test]
fn test_nullable_present_with_truncated_inner_fails() {
    let registry = FormatterRegistry::new();
    let mut input = bytes::Bytes::from(vec![1u8, 0xAA]);
    let result: Result<Option<u32>, _> = registry.deserialize(&mut input);
    assert!(matches!(result, Err(Error::ShortFrame { .. })));
}

#[test]
fn test_float_special_values_roundtrip() {
    let registry = FormatterRegistry::new();
    for value in [f64::INFINITY, f64::NEG_INFINITY, f64::MIN_POSITIVE, 0.0] {
        let mut out = BytesMut::new();
        registry.serialize(&value, &mut out).unwrap();
        let mut input = out.freeze();
        let back: f64 = registry.deserialize(&mut input).unwrap();
        assert_eq!(back, value);
    }

    let mut out = BytesMut::new();
    registry.serialize(&f64::NAN, &mut out).unwrap();
    let mut input = out.freeze();
    let back: f64 = registry.deserialize(&mut input).unwrap();
    assert!(back.is_nan());
}

// ============================================================================
// CONFIG EDGE CASES
// ============================================================================

#[test]
fn test_config_unknown_section_tolerated() {
    let toml = r#"
        [listener]
        bind = "127.0.0.1:9000"

        [unknown_section]
        whatever = 1
    "#;
    let config = TransportConfig::from_toml(toml).unwrap();
    assert_eq!(config.listener.bind, "127.0.0.1:9000");
}

#[test]
fn test_config_garbage_rejected() {
    assert!(TransportConfig::from_toml("this is not toml [[[").is_err());
}

#[test]
fn test_config_validation_collects_all_errors() {
    let config = TransportConfig::default_with_overrides(|c| {
        c.listener.bind = String::new();
        c.listener.max_connections = 0;
        c.packet.heap_alloc_threshold = 0;
        c.ratelimit.max_requests = 0;
    });
    let errors = config.validate();
    assert!(errors.len() >= 4, "expected every fault listed: {errors:?}");
}

// ============================================================================
// CONCURRENT EDGE CASES
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_encode_decode_heavy() {
    use tokio::task::JoinSet;

    let iterations = 2_000usize;
    let payload_sizes = [0usize, 64, 512, 4096];

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        tasks.spawn(async move {
            let mut codec = PacketCodec::default();
            let mut buf = BytesMut::new();
            for i in 0..iterations {
                let payload = vec![((i + size) & 0xFF) as u8; size];
                let packet = Packet::new((i & 0xFFFF) as u16, payload).with_number(1);
                tokio_util::codec::Encoder::encode(&mut codec, packet, &mut buf).unwrap();
                let decoded = codec.decode(&mut buf).unwrap();
                assert!(matches!(decoded, Some(Frame::Packet(_))));
                buf.clear();
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registry_lookups() {
    let registry = Arc::new(FormatterRegistry::new());
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..64u64 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move {
            let mut out = BytesMut::new();
            registry.serialize(&i, &mut out).unwrap();
            let mut input = out.freeze();
            let back: u64 = registry.deserialize(&mut input).unwrap();
            assert_eq!(back, i);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
}

// ============================================================================
// ERROR SURFACE
// ============================================================================

#[test]
fn test_error_kinds_are_distinguishable() {
    let short = Error::ShortFrame {
        declared: 22,
        available: 3,
    };
    let oversize = Error::Oversize {
        length: 99_999,
        max: 32_768,
    };
    assert!(short.is_fatal_for_connection());
    assert!(oversize.is_fatal_for_connection());
    assert!(!Error::UnknownOpcode(1).is_fatal_for_connection());
    assert!(!Error::Integrity {
        expected: 1,
        actual: 2
    }
    .is_fatal_for_connection());
}

#[test]
fn test_packet_decode_after_oversize_uses_new_limit() {
    // The same bytes decode under a permissive limit and fail under a
    // strict one; the limit is configuration, not wire state.
    let packet = Packet::new(1, vec![0u8; 512]);
    let bytes = packet.to_bytes().unwrap();
    let arena = PayloadArena::new(1024);

    assert!(Packet::decode(&bytes, &arena, 1024).is_ok());
    assert!(matches!(
        Packet::decode(&bytes, &arena, 256),
        Err(Error::Oversize { .. })
    ));
    assert_eq!(bytes.len(), HEADER_SIZE + 512);
}
