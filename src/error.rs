//! # Error Types
//!
//! Discriminated error kinds for the transport core.
//!
//! Every failure the core can surface is a typed variant, never a bare
//! string: framing faults, integrity failures, serialization limits, and
//! admission decisions all carry their own discriminant so callers can
//! branch on them. I/O and configuration failures wrap their sources.
//!
//! ## Disposition
//! - **Fatal for the connection**: `ShortFrame`, `Oversize`, `Backpressure`,
//!   `IdleTimeout`. The connection closes, the listener keeps running.
//! - **Recoverable per connection**: `Integrity`, `UnknownOpcode`. The
//!   packet is dropped, an event is emitted, the connection stays open.
//! - **Operation-local**: `SerializationLimit`, `UnregisteredType`,
//!   `InvalidNullable`. The encode/decode call fails, nothing else.
//! - **Startup-fatal**: `AdmissionLocked`, `RegistryLocked`, `Config`.

use std::io;
use thiserror::Error;

/// Primary error type for all transport operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Declared frame length below the header size, or the buffer drained
    /// before the declared length arrived.
    #[error("short frame: declared {declared} bytes, have {available}")]
    ShortFrame { declared: usize, available: usize },

    /// Declared frame length above the configured maximum packet size.
    #[error("oversize frame: {length} bytes exceeds maximum of {max}")]
    Oversize { length: usize, max: usize },

    /// Payload CRC32 did not match the header checksum.
    #[error("integrity failure: checksum {expected:#010x} but payload hashes to {actual:#010x}")]
    Integrity { expected: u32, actual: u32 },

    /// No handler registered for the packet's opcode.
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),

    /// A string or sequence exceeded its configured encoding limit.
    #[error("serialization limit: {length} bytes exceeds maximum of {max}")]
    SerializationLimit { length: usize, max: usize },

    /// No formatter registered for the requested type.
    #[error("no formatter registered for type {0}")]
    UnregisteredType(&'static str),

    /// Nullable flag byte was neither 0 nor 1, or a null sentinel appeared
    /// where the schema admits no null.
    #[error("invalid nullable encoding: flag byte {0:#04x}")]
    InvalidNullable(u8),

    /// String payload was not valid UTF-8.
    #[error("invalid UTF-8 in string payload")]
    InvalidUtf8,

    /// Criterion or whitelist registration attempted after the admission
    /// store locked at its first check.
    #[error("admission store is locked; registration must happen before start")]
    AdmissionLocked,

    /// Handler or formatter registration attempted after startup.
    #[error("registry is locked; registration must happen before start")]
    RegistryLocked,

    /// Admission rejected the address.
    #[error("address {0} is forbidden")]
    Forbidden(std::net::IpAddr),

    /// The tx queue stayed above its high-water mark past the drain deadline.
    #[error("backpressure: tx queue full past drain deadline")]
    Backpressure,

    /// No bytes arrived within the idle window.
    #[error("idle timeout: no activity within the idle window")]
    IdleTimeout,

    /// Operation attempted on a connection that is not open.
    #[error("connection closed")]
    ConnectionClosed,

    /// Cipher capability reported a failure.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Address or CIDR string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using the transport [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error terminates the connection it occurred on.
    ///
    /// Integrity and unknown-opcode faults drop the offending packet but
    /// keep the connection; framing faults and queue exhaustion do not.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(
            self,
            Error::Integrity { .. }
                | Error::UnknownOpcode(_)
                | Error::SerializationLimit { .. }
                | Error::UnregisteredType(_)
                | Error::InvalidNullable(_)
        )
    }
}
