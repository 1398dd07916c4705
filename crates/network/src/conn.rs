//! # Connection Lifecycle
//!
//! One `Connection` couples a reliable transport, an optional unreliable
//! transport, a rate-limited [`PacketStream`] and a serialized
//! [`EventDispatcher`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Connecting → Connected → Disconnecting → Disconnected
//!            ↓
//!         Failed (connect failure; no connection ever existed)
//! ```
//!
//! The client side drives the handshake from a dedicated task spawned by
//! [`ClientConnection::connect`]; the server side runs the mirror-image
//! exchange from the accept path. Either way the connect callback fires
//! before any pipeline task starts, so it precedes every data event without
//! needing a queue slot.
//!
//! # Task ownership
//!
//! Every spawned task (handshake, readers, stream writer, dispatcher) is
//! held as an owned handle and aborted or joined on disconnect; there is no
//! detached thread to remember about.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use gamewire_core::{ConnectionId, EngineError, IdGenerator, Result, PROTOCOL_VERSION};
use gamewire_protocol::handshake::{ConnectRequest, ConnectResponse};
use gamewire_protocol::{
    ExitPacket, Packet, PacketRegistry, PingPacket, RateAdjustPacket, RawBuffer,
};

use crate::config::ConnectionConfig;
use crate::event::{Event, EventDispatcher, EventSink};
use crate::listener::ConnectionListener;
use crate::stats::ConnectionStats;
use crate::stream::PacketStream;
use crate::sync::SyncCore;
use crate::transport::{FrameTransport, TcpTransport, UdpTransport};

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    Idle,

    /// Handshake in progress
    Connecting,

    /// Handshake complete, pipelines running
    Connected,

    /// Teardown in progress
    Disconnecting,

    /// Terminal
    Disconnected,
}

/// Which end of the handshake this connection was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The listener slot, modeled as an explicit two-mode state machine
///
/// `Async` is the normal mode; `SyncWrapped` means a [`SyncConnection`]
/// (crate::SyncConnection) has intercepted event flow and retains the
/// original for pass-through and for restoration on release.
pub(crate) enum ListenerMode {
    Async(Arc<dyn ConnectionListener>),
    SyncWrapped {
        original: Arc<dyn ConnectionListener>,
        sync: Arc<SyncCore>,
    },
}

fn next_connection_id() -> ConnectionId {
    static IDS: OnceLock<IdGenerator> = OnceLock::new();
    ConnectionId::new(IDS.get_or_init(IdGenerator::new).next())
}

/// One peer-to-peer link
///
/// # Thread Safety
/// All public methods are callable from any task. Internal state sits
/// behind short-held locks; no lock is held while a listener callback runs.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    registry: Arc<PacketRegistry>,
    state: Mutex<ConnectionState>,
    listener: Mutex<ListenerMode>,

    reliable: Mutex<Option<Arc<dyn FrameTransport>>>,
    unreliable: Mutex<Option<Arc<dyn FrameTransport>>>,
    /// Bound but not yet connected datagram socket, waiting on negotiation
    udp_socket: Mutex<Option<UdpSocket>>,

    pub(crate) stream: PacketStream,
    pub(crate) events: EventDispatcher,
    stats: Arc<ConnectionStats>,

    reader_tasks: Mutex<Vec<JoinHandle<()>>>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    connect_result: Mutex<Option<Result<()>>>,
    connect_done: Notify,

    pending_pings: Mutex<HashMap<u32, Instant>>,

    was_connected: AtomicBool,
    disconnect_delivered: AtomicBool,
    torn_down: AtomicBool,
    /// Peer announced a graceful close with an Exit packet
    graceful_exit: AtomicBool,

    /// Runs once when the connection reaches its terminal state; the accept
    /// registry uses it to deregister the connection
    terminate_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    pub(crate) fn new(
        role: Role,
        listener: Arc<dyn ConnectionListener>,
        registry: Arc<PacketRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            role,
            registry,
            state: Mutex::new(ConnectionState::Idle),
            listener: Mutex::new(ListenerMode::Async(listener)),
            reliable: Mutex::new(None),
            unreliable: Mutex::new(None),
            udp_socket: Mutex::new(None),
            stream: PacketStream::new(),
            events: EventDispatcher::new(),
            stats: Arc::new(ConnectionStats::new()),
            reader_tasks: Mutex::new(Vec::new()),
            connect_task: Mutex::new(None),
            connect_result: Mutex::new(None),
            connect_done: Notify::new(),
            pending_pings: Mutex::new(HashMap::new()),
            was_connected: AtomicBool::new(false),
            disconnect_delivered: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            graceful_exit: AtomicBool::new(false),
            terminate_hook: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &*self.reliable.lock() {
            Some(transport) => transport.local_addr(),
            None => Err(EngineError::NotConnected),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &*self.reliable.lock() {
            Some(transport) => transport.peer_addr(),
            None => Err(EngineError::NotConnected),
        }
    }

    /// Whether the unreliable datagram channel was negotiated
    pub fn has_unreliable(&self) -> bool {
        self.unreliable.lock().is_some()
    }

    /// Enqueue a clone of `packet` for sending
    ///
    /// `reliable = false` uses the datagram channel when one was negotiated
    /// and falls back to the reliable channel otherwise.
    pub fn write_packet(&self, packet: &dyn Packet, reliable: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        self.stream.write_packet(packet, reliable);
        Ok(())
    }

    /// Dequeue the next received packet; the caller takes ownership
    pub fn next_packet(&self) -> Option<Box<dyn Packet>> {
        self.stream.next_packet()
    }

    pub fn incoming_len(&self) -> usize {
        self.stream.incoming_len()
    }

    pub fn outgoing_len(&self) -> usize {
        self.stream.outgoing_len()
    }

    /// The effective outbound rate in bytes/sec, 0 = unthrottled
    pub fn current_out_rate(&self) -> u32 {
        self.stream.current_out_rate()
    }

    /// Change our flow-control caps mid-connection
    ///
    /// `out_rate` retunes our own sender; `in_rate` is the cap we grant the
    /// peer, announced with an in-band rate-adjust packet.
    pub fn set_rates(&self, in_rate: u32, out_rate: u32) -> Result<()> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        self.stream.set_requested_out(out_rate);
        self.stream.write_packet(&RateAdjustPacket::new(in_rate), true);
        Ok(())
    }

    /// Send a ping request; the round-trip lands in [`stats`](Self::stats)
    /// once the reply arrives
    pub fn ping(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        let nonce: u32 = rand::random();
        self.pending_pings.lock().insert(nonce, Instant::now());
        self.stream.write_packet(&PingPacket::request(nonce), true);
        Ok(())
    }

    /// Block until the outgoing stream drains or `timeout` passes
    pub async fn wait_to_send_all(&self, timeout: Duration) -> Result<()> {
        self.stream.wait_to_send_all(timeout).await
    }

    /// Tear down immediately, discarding unsent data
    ///
    /// Delivers `on_disconnect` (exactly once) if the connection ever
    /// reached the connected state. Disconnecting during an in-progress
    /// handshake aborts the attempt without delivering any events.
    pub async fn disconnect(&self) {
        let prior = {
            let mut state = self.state.lock();
            let prior = *state;
            match prior {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => return,
                _ => *state = ConnectionState::Disconnecting,
            }
            prior
        };

        if let Some(task) = self.connect_task.lock().take() {
            task.abort();
        }

        if prior == ConnectionState::Connected {
            self.events.signal_disconnect();
            if !EventDispatcher::on_dispatch_task() {
                self.events.join().await;
                // Normally the dispatcher finished the job; these are no-ops
                // then, and the backstop for a dispatcher that never started.
                self.teardown().await;
                *self.state.lock() = ConnectionState::Disconnected;
                self.run_terminate_hook();
            }
            // From inside a callback the dispatcher finishes the job right
            // after the current callback returns.
        } else {
            self.teardown().await;
            *self.state.lock() = ConnectionState::Disconnected;
            self.run_terminate_hook();
        }
    }

    /// Drain the outgoing stream (bounded by `timeout`), notify the peer
    /// with a graceful-close packet, then tear down
    ///
    /// Returns `Err(Timeout)` when unsent data had to be discarded anyway.
    pub async fn disconnect_send_all(&self, timeout: Duration) -> Result<()> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        self.stream.write_packet(&ExitPacket::new(), true);
        let drained = self.stream.wait_to_send_all(timeout).await;
        self.disconnect().await;
        drained
    }

    /// Surface the handshake result to the caller
    ///
    /// Complements the `on_connect` / `on_connect_failure` callbacks for
    /// code that wants to block on the attempt.
    pub async fn wait_for_connect(&self) -> Result<()> {
        loop {
            if let Some(result) = self.connect_result.lock().take() {
                return result;
            }
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Idle
                | ConnectionState::Disconnecting
                | ConnectionState::Disconnected => return Err(EngineError::NotConnected),
                ConnectionState::Connecting => {}
            }
            let notified = self.connect_done.notified();
            if self.connect_result.lock().is_some() || self.state() != ConnectionState::Connecting
            {
                continue;
            }
            notified.await;
        }
    }

    /// The listener currently receiving this connection's events
    pub(crate) fn current_listener(&self) -> Arc<dyn ConnectionListener> {
        match &*self.listener.lock() {
            ListenerMode::Async(listener) => listener.clone(),
            ListenerMode::SyncWrapped { sync, .. } => sync.clone(),
        }
    }

    /// Async → SyncWrapped transition; fails if already wrapped
    pub(crate) fn wrap_listener(&self) -> Result<Arc<SyncCore>> {
        let mut mode = self.listener.lock();
        match &*mode {
            ListenerMode::Async(original) => {
                let sync = Arc::new(SyncCore::new(original.clone()));
                *mode = ListenerMode::SyncWrapped {
                    original: original.clone(),
                    sync: sync.clone(),
                };
                Ok(sync)
            }
            ListenerMode::SyncWrapped { .. } => Err(EngineError::Protocol(
                "connection is already sync-wrapped".into(),
            )),
        }
    }

    /// SyncWrapped → Async transition; no-op in async mode
    pub(crate) fn restore_listener(&self) {
        let mut mode = self.listener.lock();
        if let ListenerMode::SyncWrapped { original, .. } = &*mode {
            *mode = ListenerMode::Async(original.clone());
        }
    }

    /// Install the hook that runs once at terminal state
    pub(crate) fn set_terminate_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.terminate_hook.lock() = Some(Box::new(hook));
    }

    fn run_terminate_hook(&self) {
        if let Some(hook) = self.terminate_hook.lock().take() {
            hook();
        }
    }

    /// Attach the negotiated transports (server-side construction)
    pub(crate) fn install_transports(
        &self,
        reliable: Arc<dyn FrameTransport>,
        unreliable: Option<Arc<dyn FrameTransport>>,
    ) {
        *self.reliable.lock() = Some(reliable);
        *self.unreliable.lock() = unreliable;
    }

    /// Spawn the reader/writer/dispatcher tasks; the connection is live
    ///
    /// Called exactly once, after the connect callback has returned.
    pub(crate) fn start_pipelines(conn: &Arc<Self>) {
        let sink: Weak<dyn EventSink> = Arc::downgrade(&(conn.clone() as Arc<dyn EventSink>));
        conn.events.start(sink);

        let reliable = conn
            .reliable
            .lock()
            .clone()
            .expect("pipelines started without a reliable transport");
        let unreliable = conn.unreliable.lock().clone();

        conn.stream.start_writer(
            reliable.clone(),
            unreliable.clone(),
            conn.events.clone(),
            conn.stats.clone(),
        );

        let mut tasks = conn.reader_tasks.lock();
        tasks.push(tokio::spawn(reader_loop(Arc::downgrade(conn), reliable)));
        if let Some(unreliable) = unreliable {
            tasks.push(tokio::spawn(reader_loop(Arc::downgrade(conn), unreliable)));
        }
    }

    pub(crate) fn torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Stop the pipelines and close the transports; idempotent
    pub(crate) async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stream.shut_down();
        self.stream.abort_writer();
        for task in self.reader_tasks.lock().drain(..) {
            task.abort();
        }

        let reliable = self.reliable.lock().clone();
        if let Some(transport) = reliable {
            transport.close().await;
        }
        let unreliable = self.unreliable.lock().clone();
        if let Some(transport) = unreliable {
            transport.close().await;
        }
        self.connect_done.notify_waiters();
    }

    /// Mark the handshake committed and deliver the connect event
    ///
    /// Shared by both roles: flips *Connecting → Connected* unless a racing
    /// disconnect won, fires `on_connect`/`on_new_conn`, then starts the
    /// pipelines.
    pub(crate) async fn commit_connected(conn: &Arc<Self>) -> bool {
        let proceed = {
            let mut state = conn.state.lock();
            if *state == ConnectionState::Connecting || *state == ConnectionState::Idle {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if !proceed {
            conn.teardown().await;
            return false;
        }
        conn.was_connected.store(true, Ordering::Release);

        let listener = conn.current_listener();
        match conn.role {
            Role::Client => listener.on_connect(conn).await,
            Role::Server => listener.on_new_conn(conn).await,
        }
        Self::start_pipelines(conn);
        true
    }

    /// Parse one received frame; returns `false` when reading must stop
    fn process_frame(&self, frame: &[u8]) -> bool {
        let mut raw = match RawBuffer::from_bytes(frame) {
            Ok(raw) => raw,
            Err(error) => {
                self.events.queue_error(error);
                return true;
            }
        };

        let mut got_data = false;
        let mut packets = 0u64;
        let mut keep_reading = true;

        loop {
            match self.registry.parse_next(&mut raw) {
                Ok(None) => break,
                Ok(Some(packet)) => {
                    packets += 1;
                    match packet.type_tag() {
                        ExitPacket::TAG => {
                            tracing::debug!("connection {} got graceful close notice", self.id);
                            self.graceful_exit.store(true, Ordering::Release);
                            self.events.signal_disconnect();
                            keep_reading = false;
                            break;
                        }
                        RateAdjustPacket::TAG => {
                            if let Ok(adjust) =
                                packet.into_any().downcast::<RateAdjustPacket>()
                            {
                                tracing::debug!(
                                    "connection {} granted rate {} by peer",
                                    self.id,
                                    adjust.rate()
                                );
                                self.stream.set_remote_granted(adjust.rate());
                            }
                        }
                        PingPacket::TAG => {
                            if let Ok(ping) = packet.into_any().downcast::<PingPacket>() {
                                if ping.is_reply() {
                                    if let Some(sent) =
                                        self.pending_pings.lock().remove(&ping.nonce())
                                    {
                                        self.stats.record_ping(sent.elapsed());
                                    }
                                } else {
                                    self.stream
                                        .write_packet(&PingPacket::reply_to(&ping), true);
                                }
                            }
                        }
                        _ => {
                            self.stream.push_incoming(packet);
                            got_data = true;
                        }
                    }
                }
                Err(error) => {
                    // Corruption taints the rest of this frame only: report
                    // once, discard the remainder, keep the stream alive.
                    tracing::warn!(
                        "connection {} discarding corrupt frame tail: {}",
                        self.id,
                        error
                    );
                    self.events.queue_error(error);
                    break;
                }
            }
        }

        self.stats.add_received(packets, frame.len() as u64);
        if got_data {
            self.events.signal_receive();
        }
        keep_reading
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl EventSink for Connection {
    async fn deliver(&self, event: Event) {
        match event {
            Event::Receive => self.current_listener().on_receive(self).await,
            Event::DoneWriting => self.current_listener().on_done_writing(self).await,
            Event::Error(error) => self.current_listener().on_error(self, error).await,
            Event::Failure(error) => {
                tracing::warn!("connection {} failed: {}", self.id, error);
                self.current_listener().on_failure(self, error).await;
                // Transport teardown sits between the failure and the
                // disconnect event, per the lifecycle contract.
                self.teardown().await;
            }
            Event::Disconnect => {
                self.teardown().await;
                if self.was_connected.load(Ordering::Acquire)
                    && !self.disconnect_delivered.swap(true, Ordering::AcqRel)
                {
                    self.current_listener().on_disconnect(self).await;
                }
                *self.state.lock() = ConnectionState::Disconnected;
                self.run_terminate_hook();
                tracing::info!("connection {} closed", self.id);
            }
        }
    }
}

/// Per-channel reader: frames in, packets to the stream, signals to the
/// dispatcher
async fn reader_loop(conn: Weak<Connection>, transport: Arc<dyn FrameTransport>) {
    loop {
        let frame = transport.recv().await;
        let Some(conn) = conn.upgrade() else { return };
        match frame {
            Ok(frame) => {
                if !conn.process_frame(&frame) {
                    return;
                }
            }
            Err(error) => {
                if conn.torn_down() {
                    return;
                }
                if conn.graceful_exit.load(Ordering::Acquire)
                    && matches!(error, EngineError::UnexpectedDisconnect)
                {
                    // The peer said goodbye first; EOF is expected.
                    conn.events.signal_disconnect();
                } else {
                    conn.events.signal_failure(error);
                }
                return;
            }
        }
    }
}

/// The initiating end of a connection
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gamewire_network::{ClientConnection, ConnectionConfig};
/// use gamewire_protocol::PacketRegistry;
///
/// # async fn example(listener: Arc<dyn gamewire_network::ConnectionListener>) -> gamewire_core::Result<()> {
/// let registry = Arc::new(PacketRegistry::new());
/// let client = ClientConnection::open(ConnectionConfig::default(), listener, registry).await?;
/// client.connect("127.0.0.1:14900".parse().unwrap())?;
/// client.wait_for_connect().await?;
/// client.connection().write_packet(&gamewire_protocol::CustomPacket::new(b"hi".to_vec()), true)?;
/// # Ok(())
/// # }
/// ```
pub struct ClientConnection {
    conn: Arc<Connection>,
    config: ConnectionConfig,
}

impl ClientConnection {
    /// Allocate local resources for a connection attempt
    ///
    /// Binds the datagram socket up front when the config requests the
    /// unreliable channel, so its port can ride the connect request.
    ///
    /// # Errors
    /// `CouldNotOpenSocket` when the datagram socket cannot be bound.
    pub async fn open(
        config: ConnectionConfig,
        listener: Arc<dyn ConnectionListener>,
        registry: Arc<PacketRegistry>,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;

        let conn = Connection::new(Role::Client, listener, registry);
        if config.unreliable {
            let socket = UdpSocket::bind(("0.0.0.0", 0))
                .await
                .map_err(EngineError::CouldNotOpenSocket)?;
            *conn.udp_socket.lock() = Some(socket);
        }
        Ok(Self { conn, config })
    }

    /// Start the handshake on its own task
    ///
    /// The outcome arrives as `on_connect` or `on_connect_failure` on the
    /// listener, and through [`wait_for_connect`](Self::wait_for_connect).
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        {
            let mut state = self.conn.state.lock();
            if *state != ConnectionState::Idle {
                return Err(EngineError::Protocol(
                    "connection attempt already started".into(),
                ));
            }
            *state = ConnectionState::Connecting;
        }

        let conn = self.conn.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            client_handshake(conn, config, addr).await;
        });
        *self.conn.connect_task.lock() = Some(task);
        Ok(())
    }

    /// Block until the handshake settles
    pub async fn wait_for_connect(&self) -> Result<()> {
        self.conn.wait_for_connect().await
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

async fn client_handshake(conn: Arc<Connection>, config: ConnectionConfig, addr: SocketAddr) {
    let result = match tokio::time::timeout(
        config.connect_timeout,
        client_handshake_inner(&conn, &config, addr),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout),
    };

    match result {
        Ok(()) => {
            if Connection::commit_connected(&conn).await {
                tracing::info!("connection {} established to {}", conn.id, addr);
                *conn.connect_result.lock() = Some(Ok(()));
            } else {
                tracing::debug!("connection {} abandoned during handshake", conn.id);
            }
            conn.connect_done.notify_waiters();
        }
        Err(error) => {
            tracing::warn!("connection attempt to {} failed: {}", addr, error);
            {
                let mut state = conn.state.lock();
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Disconnected;
                }
            }
            conn.teardown().await;
            // A connection that never completed its handshake gets a
            // connect-failure, never a disconnect.
            let listener = conn.current_listener();
            listener.on_connect_failure(&conn, &error).await;
            *conn.connect_result.lock() = Some(Err(error));
            conn.connect_done.notify_waiters();
        }
    }
}

async fn client_handshake_inner(
    conn: &Arc<Connection>,
    config: &ConnectionConfig,
    addr: SocketAddr,
) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(EngineError::CouldNotOpenSocket)?;
    stream.set_nodelay(true)?;
    let tcp: Arc<dyn FrameTransport> = Arc::new(TcpTransport::new(stream)?);
    *conn.reliable.lock() = Some(tcp.clone());

    let unreliable_port = {
        let socket = conn.udp_socket.lock();
        match socket.as_ref() {
            Some(socket) => Some(socket.local_addr()?.port()),
            None => None,
        }
    };

    let request = ConnectRequest {
        engine_version: PROTOCOL_VERSION,
        user_version: config.user_version,
        in_rate: config.requested_in_rate,
        out_rate: config.requested_out_rate,
        unreliable_port,
    };
    let mut buf = RawBuffer::new();
    request.encode(&mut buf);
    tcp.send(buf.as_slice()).await?;

    let frame = tcp.recv().await?;
    let mut raw = RawBuffer::from_bytes(&frame)?;
    match ConnectResponse::decode(&mut raw)? {
        ConnectResponse::Refuse(refuse) => Err(refuse.reason.requester_error()),
        ConnectResponse::Accept(accept) => {
            let socket = conn.udp_socket.lock().take();
            if let (Some(socket), Some(peer_port)) = (socket, accept.unreliable_port) {
                socket
                    .connect(SocketAddr::new(addr.ip(), peer_port))
                    .await?;
                *conn.unreliable.lock() = Some(Arc::new(UdpTransport::new(socket)));
            }
            conn.stream.set_requested_out(config.requested_out_rate);
            conn.stream.set_remote_granted(accept.in_rate);
            Ok(())
        }
    }
}
