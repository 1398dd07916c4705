//! End-to-end tests over localhost: full handshake, packet exchange,
//! graceful and abrupt teardown, version mismatch, and the synchronous
//! facade on a live connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;

use gamewire_core::{EngineError, Result};
use gamewire_network::{
    ClientConnection, Connection, ConnectionConfig, ConnectionListener, ConnectionParams,
    ConnectionState, ListenerConfig, ServerConnectionListener, ServerListener, SyncConnection,
};
use gamewire_protocol::{CustomPacket, PacketRegistry};

/// Counts every event and keeps received payloads.
#[derive(Default)]
struct Recorder {
    connects: AtomicUsize,
    new_conns: AtomicUsize,
    connect_failures: AtomicUsize,
    receives: AtomicUsize,
    errors: AtomicUsize,
    failures: AtomicUsize,
    disconnects: AtomicUsize,
    payloads: Mutex<Vec<Vec<u8>>>,
    /// Echo received custom packets back to the peer
    echo: bool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }
}

#[async_trait]
impl ConnectionListener for Recorder {
    async fn on_connect(&self, _conn: &Connection) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_new_conn(&self, _conn: &Connection) {
        self.new_conns.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_connect_failure(&self, _conn: &Connection, _error: &EngineError) {
        self.connect_failures.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_receive(&self, conn: &Connection) {
        self.receives.fetch_add(1, Ordering::SeqCst);
        while let Some(packet) = conn.next_packet() {
            if let Ok(custom) = packet.into_any().downcast::<CustomPacket>() {
                self.payloads.lock().push(custom.data().to_vec());
                if self.echo {
                    let _ = conn.write_packet(&*custom, true);
                }
            }
        }
    }

    async fn on_error(&self, _conn: &Connection, _error: EngineError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(&self, _conn: &Connection, _error: EngineError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_disconnect(&self, _conn: &Connection) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands every accepted connection the same listener and records listen
/// failures.
struct TestServer {
    conn_listener: Arc<Recorder>,
    in_rate: u32,
    out_rate: u32,
    listen_failures: AtomicUsize,
    last_failure_addr: Mutex<Option<SocketAddr>>,
}

impl TestServer {
    fn new(conn_listener: Arc<Recorder>) -> Arc<Self> {
        Arc::new(Self {
            conn_listener,
            in_rate: 0,
            out_rate: 0,
            listen_failures: AtomicUsize::new(0),
            last_failure_addr: Mutex::new(None),
        })
    }

    fn with_rates(conn_listener: Arc<Recorder>, in_rate: u32, out_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            conn_listener,
            in_rate,
            out_rate,
            listen_failures: AtomicUsize::new(0),
            last_failure_addr: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ServerListener for TestServer {
    async fn new_connection_params(&self, _addr: SocketAddr) -> ConnectionParams {
        ConnectionParams {
            in_rate: self.in_rate,
            out_rate: self.out_rate,
            listener: self.conn_listener.clone(),
        }
    }

    async fn on_listen_failure(&self, addr: Option<SocketAddr>, _error: EngineError) {
        self.listen_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_failure_addr.lock() = addr;
    }
}

async fn start_server(
    user: Arc<TestServer>,
    user_version: u32,
) -> Result<Arc<ServerConnectionListener>> {
    let config = ListenerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        user_version,
        ..Default::default()
    };
    ServerConnectionListener::listen(config, user, Arc::new(PacketRegistry::new())).await
}

async fn connect_client(
    addr: SocketAddr,
    listener: Arc<Recorder>,
    config: ConnectionConfig,
) -> Result<ClientConnection> {
    let client =
        ClientConnection::open(config, listener, Arc::new(PacketRegistry::new())).await?;
    client.connect(addr)?;
    client.wait_for_connect().await?;
    Ok(client)
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5 seconds");
}

#[tokio::test]
async fn test_connect_send_and_graceful_disconnect() {
    let server_events = Recorder::new();
    let server = start_server(TestServer::new(server_events.clone()), 1)
        .await
        .unwrap();

    let client_events = Recorder::new();
    let config = ConnectionConfig {
        user_version: 1,
        ..Default::default()
    };
    let client = connect_client(server.local_addr(), client_events.clone(), config)
        .await
        .unwrap();

    assert_eq!(client_events.connects.load(Ordering::SeqCst), 1);
    wait_until(|| server_events.new_conns.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.connection_count(), 1);

    // One 10-byte packet, delivered exactly once with identical bytes.
    let payload = b"0123456789".to_vec();
    client
        .connection()
        .write_packet(&CustomPacket::new(payload.clone()), true)
        .unwrap();

    wait_until(|| !server_events.payloads.lock().is_empty()).await;
    {
        let payloads = server_events.payloads.lock();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], payload);
    }
    assert_eq!(server_events.receives.load(Ordering::SeqCst), 1);

    // Graceful teardown: the peer sees a clean disconnect, no failure.
    client
        .connection()
        .disconnect_send_all(Duration::from_secs(2))
        .await
        .unwrap();

    wait_until(|| server_events.disconnects.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server_events.failures.load(Ordering::SeqCst), 0);
    assert_eq!(client_events.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.connection().state(),
        ConnectionState::Disconnected
    );
    wait_until(|| server.connection_count() == 0).await;

    server.shut_down().await;
}

#[tokio::test]
async fn test_version_mismatch_refusal() {
    let server_events = Recorder::new();
    let server_user = TestServer::new(server_events.clone());
    let server = start_server(server_user.clone(), 1).await.unwrap();

    let client_events = Recorder::new();
    let config = ConnectionConfig {
        user_version: 2,
        ..Default::default()
    };
    let client = ClientConnection::open(
        config,
        client_events.clone(),
        Arc::new(PacketRegistry::new()),
    )
    .await
    .unwrap();
    client.connect(server.local_addr()).unwrap();

    match client.wait_for_connect().await {
        Err(EngineError::UserVersionTooHigh) => {}
        other => panic!("expected UserVersionTooHigh, got {:?}", other.map(|_| ())),
    }

    wait_until(|| server_user.listen_failures.load(Ordering::SeqCst) == 1).await;
    assert!(server_user.last_failure_addr.lock().is_some());

    // Neither side ever saw a connect-class success event.
    assert_eq!(client_events.connects.load(Ordering::SeqCst), 0);
    assert_eq!(client_events.connect_failures.load(Ordering::SeqCst), 1);
    assert_eq!(server_events.new_conns.load(Ordering::SeqCst), 0);
    // And no disconnect either: the connection never existed.
    assert_eq!(client_events.disconnects.load(Ordering::SeqCst), 0);

    server.shut_down().await;
}

#[tokio::test]
async fn test_abrupt_peer_loss_is_failure_then_disconnect() {
    let server_events = Recorder::new();
    let server = start_server(TestServer::new(server_events.clone()), 0)
        .await
        .unwrap();

    let client_events = Recorder::new();
    let client = connect_client(
        server.local_addr(),
        client_events.clone(),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    wait_until(|| server_events.new_conns.load(Ordering::SeqCst) == 1).await;

    // Plain disconnect sends no goodbye: the server must see a failure and
    // then exactly one disconnect.
    client.connection().disconnect().await;
    drop(client);

    wait_until(|| server_events.disconnects.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server_events.failures.load(Ordering::SeqCst), 1);

    server.shut_down().await;
}

#[tokio::test]
async fn test_sync_facade_over_live_connection() {
    let server_events = Recorder::echoing();
    let server = start_server(TestServer::new(server_events.clone()), 0)
        .await
        .unwrap();

    let client_events = Recorder::new();
    let client = connect_client(
        server.local_addr(),
        client_events.clone(),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    let sync = SyncConnection::wrap(client.connection()).unwrap();
    sync.send(&CustomPacket::new(b"marco".to_vec())).unwrap();

    let reply: CustomPacket = tokio::time::timeout(Duration::from_secs(5), sync.recv())
        .await
        .expect("sync recv timed out")
        .unwrap();
    assert_eq!(reply.data(), b"marco");

    // While wrapped, the async listener saw none of it.
    assert_eq!(client_events.receives.load(Ordering::SeqCst), 0);

    sync.release().unwrap();
    client.connection().disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn test_rate_grant_from_handshake() {
    let server_events = Recorder::new();
    // Server grants inbound 4 KB/s to each peer.
    let server_user = TestServer::with_rates(server_events.clone(), 4_000, 0);
    let server = start_server(server_user, 0).await.unwrap();

    let client_events = Recorder::new();
    let config = ConnectionConfig {
        requested_out_rate: 10_000,
        requested_in_rate: 6_000,
        ..Default::default()
    };
    let client = connect_client(server.local_addr(), client_events.clone(), config)
        .await
        .unwrap();

    // Effective client outbound rate: min(10_000 requested, 4_000 granted).
    assert_eq!(client.connection().current_out_rate(), 4_000);

    // The server's outbound side is capped only by the client's 6 KB/s.
    wait_until(|| server.connection_count() == 1).await;
    let server_conn = server.connections().pop().unwrap();
    assert_eq!(server_conn.current_out_rate(), 6_000);

    // Lifting our requested rate mid-connection renegotiates the peer cap.
    client.connection().set_rates(12_000, 10_000).unwrap();
    assert_eq!(client.connection().current_out_rate(), 4_000);
    wait_until(|| server_conn.current_out_rate() == 12_000).await;

    client.connection().disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn test_unreliable_channel_roundtrip() {
    let server_events = Recorder::echoing();
    let server = start_server(TestServer::new(server_events.clone()), 0)
        .await
        .unwrap();

    let client_events = Recorder::new();
    let client = connect_client(
        server.local_addr(),
        client_events.clone(),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    assert!(client.connection().has_unreliable());
    wait_until(|| server.connection_count() == 1).await;
    assert!(server.connections().pop().unwrap().has_unreliable());

    // Localhost datagrams are lossless in practice.
    client
        .connection()
        .write_packet(&CustomPacket::new(b"dgram".to_vec()), false)
        .unwrap();
    wait_until(|| !client_events.payloads.lock().is_empty()).await;
    assert_eq!(client_events.payloads.lock()[0], b"dgram".to_vec());

    client.connection().disconnect().await;
    server.shut_down().await;
}

#[tokio::test]
async fn test_disconnect_during_handshake_delivers_no_events() {
    // A listener that accepts the socket but never answers the handshake.
    let stall = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = stall.local_addr().unwrap();
    let stall_task = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((socket, _)) = stall.accept().await {
                held.push(socket);
            }
        }
    });

    let client_events = Recorder::new();
    let client = ClientConnection::open(
        ConnectionConfig::default(),
        client_events.clone(),
        Arc::new(PacketRegistry::new()),
    )
    .await
    .unwrap();
    client.connect(addr).unwrap();
    sleep(Duration::from_millis(100)).await;

    // Abandon the attempt mid-handshake.
    client.connection().disconnect().await;
    assert_eq!(
        client.connection().state(),
        ConnectionState::Disconnected
    );

    sleep(Duration::from_millis(200)).await;
    assert_eq!(client_events.connects.load(Ordering::SeqCst), 0);
    assert_eq!(client_events.connect_failures.load(Ordering::SeqCst), 0);
    assert_eq!(client_events.disconnects.load(Ordering::SeqCst), 0);

    stall_task.abort();
}

#[tokio::test]
async fn test_server_full_refuses_with_refused_code() {
    let server_events = Recorder::new();
    let server_user = TestServer::new(server_events.clone());
    let config = ListenerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        max_connections: 1,
        ..Default::default()
    };
    let server = ServerConnectionListener::listen(
        config,
        server_user.clone(),
        Arc::new(PacketRegistry::new()),
    )
    .await
    .unwrap();

    let first = connect_client(
        server.local_addr(),
        Recorder::new(),
        ConnectionConfig::default(),
    )
    .await
    .unwrap();

    wait_until(|| server.connection_count() == 1).await;

    let second = ClientConnection::open(
        ConnectionConfig::default(),
        Recorder::new(),
        Arc::new(PacketRegistry::new()),
    )
    .await
    .unwrap();
    second.connect(server.local_addr()).unwrap();
    match second.wait_for_connect().await {
        Err(EngineError::Refused) => {}
        other => panic!("expected Refused, got {:?}", other.map(|_| ())),
    }

    first.connection().disconnect().await;
    server.shut_down().await;
}
