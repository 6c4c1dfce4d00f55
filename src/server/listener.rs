//! # Listener / Dispatcher
//!
//! Accepts peers, enforces admission, runs the framed receive loop, and
//! routes packets to registered handlers.
//!
//! ## Flow
//! ```text
//! accept → admission.check(ip) → Connection bound → read task
//!   read task: framed frames → decrypt → dispatch by opcode → action
//!   actions: Reply(packet) | NoReply | Close(reason)
//! ```
//!
//! One read task and one writer task per connection. Handlers execute on
//! the read task, so a connection's packets dispatch in arrival order;
//! across connections there is no ordering. The handler registry is
//! write-once: it locks when the listener starts, together with the global
//! formatter registry.

use crate::admission::AdmissionStore;
use crate::config::TransportConfig;
use crate::core::codec::{Frame, PacketCodec};
use crate::core::packet::Packet;
use crate::core::serialization::global_registry;
use crate::error::{Error, Result};
use crate::server::connection::{
    Connection, ConnectionLimits, DisconnectReason, EventHook, LoggingEvents, ViolationKind,
};
use crate::utils::arena::PayloadArena;
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

/// What a handler wants done with the connection after one packet.
#[derive(Debug)]
pub enum Action {
    /// Send this packet back on the same connection.
    Reply(Packet),
    /// Nothing to send.
    NoReply,
    /// Close the connection with the given reason.
    Close(String),
}

type HandlerFn = dyn Fn(&Connection, &Packet) -> Result<Action> + Send + Sync;

/// Opcode-keyed handler table. Write-once: registration is rejected after
/// the listener starts.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u16, Box<HandlerFn>>>,
    locked: AtomicBool,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            locked: AtomicBool::new(false),
        }
    }

    /// Register the handler for `opcode`. At most one handler per opcode;
    /// duplicates and post-start registrations fail.
    pub fn register<F>(&self, opcode: u16, handler: F) -> Result<()>
    where
        F: Fn(&Connection, &Packet) -> Result<Action> + Send + Sync + 'static,
    {
        if self.locked.load(Ordering::Acquire) {
            return Err(Error::RegistryLocked);
        }
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| Error::Config("handler registry lock poisoned".into()))?;
        if handlers.contains_key(&opcode) {
            return Err(Error::Config(format!(
                "handler already registered for opcode {opcode:#06x}"
            )));
        }
        handlers.insert(opcode, Box::new(handler));
        Ok(())
    }

    /// Dispatch one packet to its handler.
    pub fn dispatch(&self, conn: &Connection, packet: &Packet) -> Result<Action> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| Error::Config("handler registry lock poisoned".into()))?;
        match handlers.get(&packet.opcode) {
            Some(handler) => handler(conn, packet),
            None => Err(Error::UnknownOpcode(packet.opcode)),
        }
    }

    pub fn has_handler(&self, opcode: u16) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(&opcode))
            .unwrap_or(false)
    }

    fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary-port listener: owns the admission store, the handler registry,
/// and every accepted connection.
pub struct Listener {
    config: TransportConfig,
    admission: Arc<AdmissionStore>,
    handlers: Arc<HandlerRegistry>,
    arena: Arc<PayloadArena>,
    events: Arc<dyn EventHook>,
}

impl Listener {
    /// Build a listener from validated configuration.
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate_strict()?;
        let arena = Arc::new(PayloadArena::new(config.packet.heap_alloc_threshold));
        let admission = Arc::new(AdmissionStore::new(&config.admission));
        Ok(Self {
            config,
            admission,
            handlers: Arc::new(HandlerRegistry::new()),
            arena,
            events: Arc::new(LoggingEvents),
        })
    }

    /// The admission store, for criterion and whitelist registration
    /// before start.
    pub fn admission(&self) -> &Arc<AdmissionStore> {
        &self.admission
    }

    /// The handler registry, for opcode registration before start.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Replace the event hook (default logs through tracing).
    pub fn with_events(mut self, events: Arc<dyn EventHook>) -> Self {
        self.events = events;
        self
    }

    /// Bind the endpoint and start accepting. Registries lock here.
    #[instrument(skip(self), fields(bind = %self.config.listener.bind))]
    pub async fn start(self) -> Result<ListenerHandle> {
        let socket = TcpListener::bind(&self.config.listener.bind).await?;
        let local_addr = socket.local_addr()?;
        info!(address = %local_addr, "Listening");

        self.handlers.lock();
        global_registry().lock();

        let purge_task = self
            .admission
            .spawn_purge(self.config.admission.purge_interval);
        let sweeper_task = self
            .arena
            .spawn_sweeper(self.config.admission.purge_interval);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let accept = AcceptLoop {
            config: self.config.clone(),
            admission: Arc::clone(&self.admission),
            handlers: Arc::clone(&self.handlers),
            arena: Arc::clone(&self.arena),
            events: Arc::clone(&self.events),
            active: Arc::clone(&active),
            next_id: AtomicU64::new(1),
        };

        let join = tokio::spawn(accept.run(socket, shutdown_rx));

        Ok(ListenerHandle {
            local_addr,
            shutdown_tx,
            join,
            active,
            purge_task,
            sweeper_task,
            shutdown_timeout: self.config.listener.shutdown_timeout,
        })
    }
}

/// Running listener: address, shutdown control, and task bookkeeping.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    active: Arc<AtomicUsize>,
    purge_task: tokio::task::JoinHandle<()>,
    sweeper_task: tokio::task::JoinHandle<()>,
    shutdown_timeout: std::time::Duration,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently alive.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Signal shutdown and wait for the accept loop and connections to
    /// finish, up to the configured deadline.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(self.shutdown_timeout, self.join)
            .await
            .is_err()
        {
            warn!("Shutdown deadline reached, forcing exit");
        }
        self.purge_task.abort();
        self.sweeper_task.abort();
    }
}

struct AcceptLoop {
    config: TransportConfig,
    admission: Arc<AdmissionStore>,
    handlers: Arc<HandlerRegistry>,
    arena: Arc<PayloadArena>,
    events: Arc<dyn EventHook>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl AcceptLoop {
    async fn run(self, socket: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutting down listener, waiting for connections to close");
                        break;
                    }
                }

                accepted = socket.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer, &shutdown_rx, &mut tasks).await,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }

        // Connections observe the same shutdown signal; give them the
        // bounded deadline before aborting what remains.
        let deadline = self.config.listener.shutdown_timeout;
        if tokio::time::timeout(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("Connections still open at shutdown deadline, aborting");
            tasks.abort_all();
        }
    }

    async fn admit(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown_rx: &watch::Receiver<bool>,
        tasks: &mut tokio::task::JoinSet<()>,
    ) {
        if self.active.load(Ordering::Relaxed) >= self.config.listener.max_connections {
            warn!(%peer, "Connection limit reached, refusing");
            drop(stream);
            return;
        }

        if let Err(e) = self.admission.check(peer.ip()).await {
            debug!(%peer, error = %e, "Admission refused connection");
            drop(stream);
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let limits = ConnectionLimits {
            max_frame_size: self.config.packet.max_size,
            tx_highwater: self.config.connection.tx_highwater,
            tx_lowwater: self.config.connection.tx_lowwater,
            tx_drain_deadline: self.config.connection.tx_drain_deadline,
        };
        let (conn, tx_rx) = Connection::open(id, peer, limits);

        self.active.fetch_add(1, Ordering::Relaxed);
        global_metrics().connection_established();
        self.events.connected(&conn);

        let session = ConnectionSession {
            conn,
            handlers: Arc::clone(&self.handlers),
            arena: Arc::clone(&self.arena),
            events: Arc::clone(&self.events),
            active: Arc::clone(&self.active),
            config: self.config.clone(),
        };
        tasks.spawn(session.run(stream, tx_rx, shutdown_rx.clone()));
    }
}

struct ConnectionSession {
    conn: Arc<Connection>,
    handlers: Arc<HandlerRegistry>,
    arena: Arc<PayloadArena>,
    events: Arc<dyn EventHook>,
    active: Arc<AtomicUsize>,
    config: TransportConfig,
}

impl ConnectionSession {
    async fn run(
        self,
        stream: TcpStream,
        tx_rx: mpsc::Receiver<Bytes>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let codec = PacketCodec::new(self.config.packet.max_size, Arc::clone(&self.arena));
        let framed = FramedRead::new(read_half, codec);

        let writer = tokio::spawn(run_writer(write_half, tx_rx, Arc::clone(&self.conn)));

        self.read_loop(framed, shutdown_rx).await;

        // Reaching here the connection is Closing; the writer flushes the
        // queue and exits, completing the transition.
        let _ = writer.await;
        self.conn.mark_closed();

        let reason = self
            .conn
            .close_reason()
            .unwrap_or(DisconnectReason::PeerClosed);
        self.events.disconnected(&self.conn, &reason);
        global_metrics().connection_closed();
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    async fn read_loop(
        &self,
        mut framed: FramedRead<tokio::net::tcp::OwnedReadHalf, PacketCodec>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let idle = self.config.connection.idle_timeout;

        loop {
            let frame = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.conn.close(DisconnectReason::ShuttingDown);
                        return;
                    }
                    continue;
                }
                _ = self.conn.closing_signal() => return,
                next = tokio::time::timeout(idle, framed.next()) => next,
            };

            match frame {
                Err(_elapsed) => {
                    global_metrics().idle_close();
                    self.conn.close(DisconnectReason::IdleTimeout);
                    return;
                }
                Ok(None) => {
                    self.conn.close(DisconnectReason::PeerClosed);
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!(id = self.conn.id(), error = %e, "Fatal framing fault");
                    self.events.protocol_violation(
                        &self.conn,
                        &ViolationKind::FatalFrame {
                            detail: e.to_string(),
                        },
                    );
                    self.conn
                        .close(DisconnectReason::FrameError(e.to_string()));
                    return;
                }
                Ok(Some(Ok(Frame::Corrupt { opcode, length, .. }))) => {
                    global_metrics().integrity_failure();
                    self.events
                        .protocol_violation(&self.conn, &ViolationKind::Integrity { opcode });
                    debug!(
                        id = self.conn.id(),
                        opcode,
                        length,
                        "Dropped frame with bad checksum"
                    );
                }
                Ok(Some(Ok(Frame::Packet(packet)))) => {
                    self.conn.touch();
                    global_metrics().packet_received(packet.frame_len() as u64);
                    if self.handle_packet(packet).await {
                        return;
                    }
                }
            }
        }
    }

    /// Dispatch one packet. Returns `true` when the read loop should stop.
    async fn handle_packet(&self, packet: Packet) -> bool {
        let packet = match self.conn.apply_cipher_in(packet) {
            Ok(packet) => packet,
            Err(kind) => {
                self.events.protocol_violation(&self.conn, &kind);
                return false;
            }
        };

        self.events.packet_received(&self.conn, &packet);

        match self.handlers.dispatch(&self.conn, &packet) {
            Ok(Action::Reply(reply)) => match self.conn.send(reply).await {
                Ok(()) => false,
                Err(Error::Backpressure) => {
                    self.conn.close(DisconnectReason::Backpressure);
                    true
                }
                Err(_) => true,
            },
            Ok(Action::NoReply) => false,
            Ok(Action::Close(reason)) => {
                self.conn.close(DisconnectReason::HandlerClosed(reason));
                true
            }
            Err(Error::UnknownOpcode(opcode)) => {
                global_metrics().unknown_opcode();
                self.events
                    .protocol_violation(&self.conn, &ViolationKind::UnknownOpcode(opcode));
                false
            }
            Err(e) => {
                // Handler faults are contained; the connection stays open.
                warn!(
                    id = self.conn.id(),
                    opcode = packet.opcode,
                    error = %e,
                    "Handler failed"
                );
                false
            }
        }
    }
}

/// Drains the tx queue onto the socket. Exits when the queue closes or the
/// connection starts closing, flushing whatever is already queued.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut tx_rx: mpsc::Receiver<Bytes>,
    conn: Arc<Connection>,
) {
    loop {
        tokio::select! {
            queued = tx_rx.recv() => {
                match queued {
                    Some(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            conn.close(DisconnectReason::PeerClosed);
                            break;
                        }
                        conn.note_written();
                    }
                    None => break,
                }
            }
            _ = conn.closing_signal() => {
                // Flush only: whatever is queued goes out, nothing new is
                // accepted.
                while let Ok(frame) = tx_rx.try_recv() {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;
}
