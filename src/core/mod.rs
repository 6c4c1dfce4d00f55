//! # Core Protocol Components
//!
//! Low-level packet handling, codecs, and binary serialization.
//!
//! This module provides the foundation for the transport, handling packet
//! framing, encoding/decoding, and the wire format.
//!
//! ## Components
//! - **Packet**: fixed 22-byte header with CRC32 payload integrity
//! - **Codec**: tokio codec for framing over byte streams
//! - **Serialization**: type-indexed formatter registry
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [OpCode(2)] [Number(1)] [Kind(1)] [Flags(1)] [Priority(1)]
//! [Checksum(4)] [Timestamp(8)] [Reserved(2)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Length validation before allocation
//! - Checksum recomputed on decode, never trusted from the wire
//! - Frame ceiling prevents memory exhaustion

pub mod codec;
pub mod packet;
pub mod serialization;

pub use codec::{Frame, PacketCodec};
pub use packet::Packet;
