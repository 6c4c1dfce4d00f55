//! # framewire
//!
//! High-throughput binary-framed network transport.
//!
//! The crate provides a length-prefixed packet protocol with CRC32
//! integrity checking, a zero-copy-friendly serialization layer built on a
//! type-indexed formatter registry, and a connection runtime that applies
//! IP admission control, per-IP rate limiting, and opcode-routed dispatch.
//!
//! ## Layers
//! - [`core`](crate::core): the wire format: [`Packet`](crate::core::packet::Packet),
//!   the framing [`PacketCodec`](crate::core::codec::PacketCodec), and the
//!   formatter registry.
//! - [`admission`]: whitelist, ban store, and the pluggable criterion
//!   chain (including the sliding-window rate limiter).
//! - [`server`]: connections, backpressure, and the accepting listener.
//! - [`config`], [`error`], [`utils`]: the ambient stack.
//!
//! ## Example
//! ```rust,no_run
//! use framewire::config::TransportConfig;
//! use framewire::core::packet::Packet;
//! use framewire::server::{Action, Listener};
//!
//! # async fn run() -> framewire::error::Result<()> {
//! let listener = Listener::new(TransportConfig::default())?;
//! listener.handlers().register(0x0001, |_conn, packet| {
//!     Ok(Action::Reply(Packet::new(0x0002, packet.payload().to_vec())))
//! })?;
//! listener.admission().add_to_whitelist("127.0.0.1")?;
//!
//! let handle = listener.start().await?;
//! // ... serve ...
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod utils;

pub use config::TransportConfig;
pub use core::codec::{Frame, PacketCodec};
pub use core::packet::Packet;
pub use error::{Error, Result};
pub use server::{Action, Listener};
