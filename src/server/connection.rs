//! # Connection
//!
//! Per-client state: identity, lifecycle, tx queue, and cipher binding.
//!
//! ## State machine
//!
//! ```text
//! ┌──────┐ close()/fatal frame/peer EOF ┌─────────┐ tx drained ┌────────┐
//! │ Open │─────────────────────────────>│ Closing │───────────>│ Closed │
//! └──────┘                              └─────────┘ or deadline└────────┘
//! ```
//!
//! Transitions are monotone; nothing moves a connection backwards. The
//! listener owns each connection for its lifetime; handlers borrow it for
//! the duration of one dispatch.
//!
//! ## Backpressure
//!
//! Sends enqueue encoded frames on a bounded channel sized at the tx
//! high-water mark. A saturated queue parks the sender until the writer
//! drains the queue to the low-water mark; if the drain deadline passes
//! first, the send fails with a backpressure disposition and the
//! connection closes.

use crate::core::packet::{flags, Packet};
use crate::error::{Error, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::time::unix_millis;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Unique connection identifier, monotonically assigned by the listener.
pub type ConnectionId = u64;

/// Connection lifecycle state. Ordering is the transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end of the stream.
    PeerClosed,
    /// No bytes arrived inside the idle window.
    IdleTimeout,
    /// The tx queue stayed saturated past the drain deadline.
    Backpressure,
    /// A fatal framing fault (short or oversize frame).
    FrameError(String),
    /// The listener is shutting down.
    ShuttingDown,
    /// A handler returned a close action.
    HandlerClosed(String),
}

/// Protocol violations observable through the event hook. Only
/// [`ViolationKind::FatalFrame`] closes the connection; the rest drop the
/// offending packet and keep it open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Frame consumed but its CRC did not match.
    Integrity { opcode: u16 },
    /// No handler registered for the opcode.
    UnknownOpcode(u16),
    /// Encrypted flag set with no cipher bound, or the cipher rejected the
    /// payload.
    CipherMismatch,
    /// Declared length below the header size or above the frame ceiling.
    FatalFrame { detail: String },
}

/// Opaque symmetric transform bound to a connection.
///
/// The core knows nothing about the algorithm; key rotation and negotiation
/// belong to the handler layer.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>>;
}

/// Observable connection events. Default implementations ignore everything;
/// the listener's default hook logs through tracing.
pub trait EventHook: Send + Sync {
    fn connected(&self, _conn: &Connection) {}
    fn disconnected(&self, _conn: &Connection, _reason: &DisconnectReason) {}
    fn packet_received(&self, _conn: &Connection, _packet: &Packet) {}
    fn protocol_violation(&self, _conn: &Connection, _kind: &ViolationKind) {}
}

/// Event hook that narrates connection life through tracing.
#[derive(Debug, Default)]
pub struct LoggingEvents;

impl EventHook for LoggingEvents {
    fn connected(&self, conn: &Connection) {
        debug!(id = conn.id(), peer = %conn.remote_addr(), "Connection established");
    }

    fn disconnected(&self, conn: &Connection, reason: &DisconnectReason) {
        debug!(id = conn.id(), peer = %conn.remote_addr(), ?reason, "Connection closed");
    }

    fn protocol_violation(&self, conn: &Connection, kind: &ViolationKind) {
        tracing::warn!(id = conn.id(), peer = %conn.remote_addr(), ?kind, "Protocol violation");
    }
}

/// Tuning knobs the listener hands each connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_size: usize,
    pub tx_highwater: usize,
    pub tx_lowwater: usize,
    pub tx_drain_deadline: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        let defaults = crate::config::ConnectionConfig::default();
        Self {
            max_frame_size: crate::config::DEFAULT_MAX_PACKET_SIZE,
            tx_highwater: defaults.tx_highwater,
            tx_lowwater: defaults.tx_lowwater,
            tx_drain_deadline: defaults.tx_drain_deadline,
        }
    }
}

/// Per-client connection state, owned exclusively by the listener.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    state: AtomicU8,
    tx: mpsc::Sender<Bytes>,
    limits: ConnectionLimits,
    /// Signaled by the writer whenever the queue falls to the low-water mark.
    drained: Notify,
    /// Signaled once when the connection enters Closing.
    closing: Notify,
    last_activity_ms: AtomicI64,
    cipher: RwLock<Option<Arc<dyn Cipher>>>,
    close_reason: RwLock<Option<DisconnectReason>>,
}

impl Connection {
    /// Create a connection and the receiving end of its tx queue. The
    /// caller (normally the listener) drives the receiver from a writer
    /// task.
    pub fn open(
        id: ConnectionId,
        remote_addr: SocketAddr,
        limits: ConnectionLimits,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(limits.tx_highwater.max(1));
        let conn = Arc::new(Self {
            id,
            remote_addr,
            state: AtomicU8::new(ConnectionState::Open as u8),
            tx,
            limits,
            drained: Notify::new(),
            closing: Notify::new(),
            last_activity_ms: AtomicI64::new(unix_millis()),
            cipher: RwLock::new(None),
            close_reason: RwLock::new(None),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unix milliseconds of the last received frame.
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Bind an opaque cipher. Subsequent sends encrypt the payload and set
    /// the encrypted flag; received frames carrying the flag are decrypted.
    pub fn bind_cipher(&self, cipher: Arc<dyn Cipher>) {
        if let Ok(mut slot) = self.cipher.write() {
            *slot = Some(cipher);
        }
    }

    pub fn cipher(&self) -> Option<Arc<dyn Cipher>> {
        self.cipher.read().ok().and_then(|slot| slot.clone())
    }

    /// Encode and enqueue a packet for transmission.
    ///
    /// Fails `ConnectionClosed` unless the connection is open. When the
    /// queue is at the high-water mark the call waits for the writer to
    /// drain it; past the drain deadline it fails `Backpressure` (the
    /// caller is expected to close the connection).
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(Error::ConnectionClosed);
        }

        let packet = self.apply_cipher_out(packet)?;
        let mut buf = BytesMut::with_capacity(packet.frame_len());
        packet.encode_to(&mut buf, self.limits.max_frame_size)?;
        let frame: Bytes = buf.freeze();
        let frame_len = frame.len() as u64;

        match self.tx.try_send(frame) {
            Ok(()) => {
                global_metrics().packet_sent(frame_len);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Park until the writer reports low water, bounded by the
                // drain deadline.
                let waited =
                    tokio::time::timeout(self.limits.tx_drain_deadline, self.drained.notified())
                        .await;
                if waited.is_err() {
                    global_metrics().backpressure_close();
                    return Err(Error::Backpressure);
                }
                self.tx
                    .send(frame)
                    .await
                    .map_err(|_| Error::ConnectionClosed)?;
                global_metrics().packet_sent(frame_len);
                Ok(())
            }
        }
    }

    /// Begin teardown. Idempotent; only the first call records the reason.
    /// The writer flushes whatever is queued and the connection then moves
    /// to Closed.
    pub fn close(&self, reason: DisconnectReason) {
        let prior = self
            .state
            .fetch_max(ConnectionState::Closing as u8, Ordering::AcqRel);
        if prior == ConnectionState::Open as u8 {
            if let Ok(mut slot) = self.close_reason.write() {
                *slot = Some(reason);
            }
            self.closing.notify_waiters();
            self.closing.notify_one();
        }
    }

    /// Final transition; called by the owner once the writer has finished.
    pub fn mark_closed(&self) {
        self.state
            .fetch_max(ConnectionState::Closed as u8, Ordering::AcqRel);
    }

    /// The reason recorded by the first `close` call.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.read().ok().and_then(|slot| slot.clone())
    }

    /// Resolves when the connection enters Closing.
    pub(crate) async fn closing_signal(&self) {
        if self.state() != ConnectionState::Open {
            return;
        }
        self.closing.notified().await;
    }

    /// Writer-side bookkeeping after each frame leaves the queue: wakes
    /// parked senders once the queue falls to the low-water mark.
    pub fn note_written(&self) {
        let queued = self
            .limits
            .tx_highwater
            .saturating_sub(self.tx.capacity());
        if queued <= self.limits.tx_lowwater {
            self.drained.notify_waiters();
        }
    }

    /// Frames currently queued for transmission.
    pub fn tx_queued(&self) -> usize {
        self.limits
            .tx_highwater
            .saturating_sub(self.tx.capacity())
    }

    /// Decrypt an inbound packet if its encrypted flag is set.
    ///
    /// Returns the violation kind instead of a packet when the flag is set
    /// with no cipher bound or the cipher rejects the payload.
    pub(crate) fn apply_cipher_in(
        &self,
        packet: Packet,
    ) -> std::result::Result<Packet, ViolationKind> {
        if packet.flags & flags::ENCRYPTED == 0 {
            return Ok(packet);
        }
        let Some(cipher) = self.cipher() else {
            return Err(ViolationKind::CipherMismatch);
        };
        match cipher.decrypt(packet.payload()) {
            Ok(plain) => {
                let flags = packet.flags & !flags::ENCRYPTED;
                Ok(packet.with_payload(plain).with_flags(flags))
            }
            Err(_) => Err(ViolationKind::CipherMismatch),
        }
    }

    fn apply_cipher_out(&self, packet: Packet) -> Result<Packet> {
        let Some(cipher) = self.cipher() else {
            return Ok(packet);
        };
        let sealed = cipher.encrypt(packet.payload())?;
        let flags = packet.flags | flags::ENCRYPTED;
        Ok(packet.with_payload(sealed).with_flags(flags))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("tx_queued", &self.tx_queued())
            .finish_non_exhaustive()
    }
}
