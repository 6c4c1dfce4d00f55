//! # Utility Modules
//!
//! Supporting utilities for payload storage, logging, metrics, and timing.
//!
//! ## Components
//! - **Arena**: two-tier pooled payload buffers with deferred reclamation
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Time**: unix-millisecond clock for packet timestamps and expiry

pub mod arena;
pub mod logging;
pub mod metrics;
pub mod time;

pub use arena::{Payload, PayloadArena};
