//! Listener traits: the application's side of the event contract
//!
//! A `ConnectionListener` receives every event for one connection, strictly
//! serialized: no two callbacks for the same connection ever run at once,
//! and no engine lock is held while a callback runs. Callbacks should not
//! block indefinitely, since that stalls the connection's whole event
//! pipeline (other connections are unaffected).
//!
//! Guaranteed ordering per connection: `on_connect`/`on_new_conn` precede
//! every data event; `on_disconnect` follows everything else and fires
//! exactly once if the connection ever reached the connected state; a fatal
//! `on_failure` is always followed directly by `on_disconnect`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use gamewire_core::EngineError;

use crate::conn::Connection;

/// Callback target for one connection's events
///
/// All methods default to no-ops so implementations only override what they
/// care about.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// The client side completed its handshake
    async fn on_connect(&self, conn: &Connection) {
        let _ = conn;
    }

    /// The server side completed a handshake for this connection
    async fn on_new_conn(&self, conn: &Connection) {
        let _ = conn;
    }

    /// A client-side connection attempt failed; no connection ever existed,
    /// so no `on_disconnect` will follow
    async fn on_connect_failure(&self, conn: &Connection, error: &EngineError) {
        let _ = (conn, error);
    }

    /// One or more packets are waiting in the incoming queue
    ///
    /// Signals coalesce: drain the queue with
    /// [`Connection::next_packet`] until it returns `None`.
    async fn on_receive(&self, conn: &Connection) {
        let _ = conn;
    }

    /// The outgoing queues just drained
    async fn on_done_writing(&self, conn: &Connection) {
        let _ = conn;
    }

    /// A non-fatal error; the stream continues
    async fn on_error(&self, conn: &Connection, error: EngineError) {
        let _ = (conn, error);
    }

    /// A fatal failure; `on_disconnect` follows immediately, with no other
    /// events in between
    async fn on_failure(&self, conn: &Connection, error: EngineError) {
        let _ = (conn, error);
    }

    /// The connection is gone; always the last event, delivered exactly once
    async fn on_disconnect(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// Flow-control and listener choices for one accepted connection
pub struct ConnectionParams {
    /// Inbound cap granted to the peer in bytes/sec, 0 = unlimited
    pub in_rate: u32,
    /// Our own outbound cap in bytes/sec, 0 = unlimited
    pub out_rate: u32,
    /// Listener receiving this connection's events
    pub listener: Arc<dyn ConnectionListener>,
}

/// Callback target for the accepting endpoint
#[async_trait]
pub trait ServerListener: Send + Sync {
    /// Produce the per-connection parameters for a peer that just passed
    /// version validation
    async fn new_connection_params(&self, addr: SocketAddr) -> ConnectionParams;

    /// An inbound attempt failed before `on_new_conn` could complete
    ///
    /// The offending remote address is attached when it is known. The
    /// per-connection listener may not exist yet, which is why failures land
    /// here instead.
    async fn on_listen_failure(&self, addr: Option<SocketAddr>, error: EngineError) {
        let _ = (addr, error);
    }
}
