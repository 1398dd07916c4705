//! # Accepting Endpoint
//!
//! Owns the listening socket, runs the accept loop, and drives the server
//! side of the handshake for every inbound attempt, each on its own task,
//! so a slow or malicious peer mid-handshake never blocks acceptance of
//! other peers.
//!
//! The listener owns its live connections, keyed by connection id; a
//! connection that reaches its terminal state deregisters itself from the
//! map through a termination hook.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use gamewire_core::{ConnectionId, EngineError, Result};
use gamewire_protocol::handshake::{ConnectAccept, ConnectRefuse, ConnectRequest, RefuseReason};
use gamewire_protocol::{PacketRegistry, RawBuffer};

use crate::config::ListenerConfig;
use crate::conn::{Connection, ConnectionState, Role};
use crate::listener::ServerListener;
use crate::transport::{FrameTransport, TcpTransport, UdpTransport};

/// Accepts inbound connections and spawns server-side `Connection`s
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gamewire_network::{ListenerConfig, ServerConnectionListener};
/// use gamewire_protocol::PacketRegistry;
///
/// # async fn example(user: Arc<dyn gamewire_network::ServerListener>) -> gamewire_core::Result<()> {
/// let config = ListenerConfig {
///     bind_address: "0.0.0.0:14900".parse().unwrap(),
///     ..Default::default()
/// };
/// let listener = ServerConnectionListener::listen(config, user, Arc::new(PacketRegistry::new())).await?;
/// println!("listening on {}", listener.local_addr());
/// # Ok(())
/// # }
/// ```
pub struct ServerConnectionListener {
    config: ListenerConfig,
    registry: Arc<PacketRegistry>,
    user: Arc<dyn ServerListener>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl ServerConnectionListener {
    /// Bind the listening socket and start accepting
    ///
    /// # Errors
    /// `CouldNotOpenSocket` when the bind fails; `Config` for an invalid
    /// configuration.
    pub async fn listen(
        config: ListenerConfig,
        user: Arc<dyn ServerListener>,
        registry: Arc<PacketRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(EngineError::Config)?;

        let listener = bind_listener(config.bind_address)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("listening on {}", local_addr);

        let this = Arc::new(Self {
            config,
            registry,
            user,
            connections: DashMap::new(),
            accept_task: Mutex::new(None),
            local_addr,
        });

        let weak = Arc::downgrade(&this);
        let task = tokio::spawn(accept_loop(weak, listener));
        *this.accept_task.lock() = Some(task);
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections
            .retain(|_, conn| conn.state() != ConnectionState::Disconnected);
        self.connections.len()
    }

    /// A live connection by id, if it is still around
    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .filter(|conn| conn.state() != ConnectionState::Disconnected)
    }

    /// Snapshot of all live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|conn| conn.state() != ConnectionState::Disconnected)
            .collect()
    }

    /// Stop accepting and disconnect every live connection
    pub async fn shut_down(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let live = self.connections();
        for conn in live {
            conn.disconnect().await;
        }
        self.connections.clear();
        tracing::info!("listener on {} shut down", self.local_addr);
    }
}

/// Bind with `SO_REUSEADDR` so quick restarts do not trip over TIME_WAIT
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(EngineError::CouldNotOpenSocket)?;
    socket
        .set_reuse_address(true)
        .map_err(EngineError::CouldNotOpenSocket)?;
    socket
        .bind(&addr.into())
        .map_err(EngineError::CouldNotOpenSocket)?;
    socket
        .listen(1024)
        .map_err(EngineError::CouldNotOpenSocket)?;
    socket
        .set_nonblocking(true)
        .map_err(EngineError::CouldNotOpenSocket)?;
    TcpListener::from_std(socket.into()).map_err(EngineError::CouldNotOpenSocket)
}

async fn accept_loop(this: Weak<ServerConnectionListener>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let Some(this) = this.upgrade() else { return };
                tracing::debug!("inbound connection attempt from {}", addr);
                tokio::spawn(async move {
                    server_handshake(this, socket, addr).await;
                });
            }
            Err(error) => {
                let Some(this) = this.upgrade() else { return };
                tracing::error!("accept failed: {}", error);
                this.user
                    .on_listen_failure(None, EngineError::Io(error))
                    .await;
            }
        }
    }
}

/// Server side of the handshake, one task per attempt
async fn server_handshake(this: Arc<ServerConnectionListener>, socket: TcpStream, addr: SocketAddr) {
    let result = tokio::time::timeout(
        this.config.handshake_timeout,
        server_handshake_inner(&this, socket, addr),
    )
    .await
    .unwrap_or(Err(EngineError::Timeout));

    match result {
        Ok(conn) => {
            // The registry owns the connection; a disconnected connection
            // deregisters itself through the termination hook.
            this.connections.insert(conn.id(), conn.clone());
            let registry = Arc::downgrade(&this);
            let id = conn.id();
            conn.set_terminate_hook(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.connections.remove(&id);
                }
            });
            if Connection::commit_connected(&conn).await {
                tracing::info!("connection {} accepted from {}", conn.id(), addr);
            } else {
                this.connections.remove(&conn.id());
            }
        }
        Err(error) => {
            tracing::warn!("handshake with {} failed: {}", addr, error);
            this.user.on_listen_failure(Some(addr), error).await;
        }
    }
}

async fn server_handshake_inner(
    this: &Arc<ServerConnectionListener>,
    socket: TcpStream,
    addr: SocketAddr,
) -> Result<Arc<Connection>> {
    socket.set_nodelay(true)?;
    let tcp: Arc<dyn FrameTransport> = Arc::new(TcpTransport::new(socket)?);

    let frame = tcp.recv().await?;
    let mut raw = RawBuffer::from_bytes(&frame)?;
    let request = ConnectRequest::decode(&mut raw)?;

    if this.connection_count() >= this.config.max_connections {
        refuse(&tcp, RefuseReason::Refused).await;
        tracing::warn!(
            "refused {}: server full ({} connections)",
            addr,
            this.config.max_connections
        );
        return Err(EngineError::Refused);
    }

    if let Err(reason) = request.validate(this.config.user_version) {
        refuse(&tcp, reason).await;
        return Err(reason.accepter_error());
    }

    let params = this.user.new_connection_params(addr).await;

    // Unreliable channel: only when the peer asked and policy allows.
    let mut udp_transport: Option<Arc<dyn FrameTransport>> = None;
    let mut unreliable_port = None;
    if this.config.unreliable {
        if let Some(peer_port) = request.unreliable_port {
            let socket = UdpSocket::bind(("0.0.0.0", 0))
                .await
                .map_err(EngineError::CouldNotOpenSocket)?;
            unreliable_port = Some(socket.local_addr()?.port());
            socket
                .connect(SocketAddr::new(addr.ip(), peer_port))
                .await?;
            udp_transport = Some(Arc::new(UdpTransport::new(socket)));
        }
    }

    let accept = ConnectAccept {
        in_rate: params.in_rate,
        out_rate: params.out_rate,
        unreliable_port,
    };
    let mut buf = RawBuffer::new();
    accept.encode(&mut buf);
    tcp.send(buf.as_slice()).await?;

    let conn = Connection::new(Role::Server, params.listener, this.registry.clone());
    conn.install_transports(tcp, udp_transport);
    conn.stream.set_requested_out(params.out_rate);
    // The peer's requested inbound cap is our granted outbound rate.
    conn.stream.set_remote_granted(request.in_rate);
    Ok(conn)
}

async fn refuse(tcp: &Arc<dyn FrameTransport>, reason: RefuseReason) {
    let mut buf = RawBuffer::new();
    ConnectRefuse { reason }.encode(&mut buf);
    // The attempt is already doomed; a failed refusal write changes nothing.
    let _ = tcp.send(buf.as_slice()).await;
}
