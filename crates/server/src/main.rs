//! GameWire demo server
//!
//! A minimal echo server on top of the engine: accepts connections, answers
//! pings, and bounces every custom packet back to its sender.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn, Level};

use gamewire_core::EngineError;
use gamewire_network::{
    Connection, ConnectionListener, ConnectionParams, ListenerConfig, ServerConnectionListener,
    ServerListener,
};
use gamewire_protocol::{CustomPacket, PacketRegistry};

/// Options file (JSON), all fields optional
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerOptions {
    bind_address: SocketAddr,
    max_connections: usize,
    user_version: u32,
    /// Inbound cap granted to each peer in bytes/sec, 0 = unlimited
    in_rate: u32,
    /// Outbound cap per connection in bytes/sec, 0 = unlimited
    out_rate: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:14900".parse().unwrap(),
            max_connections: 1000,
            user_version: 0,
            in_rate: 0,
            out_rate: 0,
        }
    }
}

impl ServerOptions {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Bounces every custom packet back to its sender
struct EchoListener;

#[async_trait]
impl ConnectionListener for EchoListener {
    async fn on_new_conn(&self, conn: &Connection) {
        match conn.peer_addr() {
            Ok(addr) => info!("connection {} up from {}", conn.id(), addr),
            Err(_) => info!("connection {} up", conn.id()),
        }
    }

    async fn on_receive(&self, conn: &Connection) {
        while let Some(packet) = conn.next_packet() {
            if let Ok(custom) = packet.into_any().downcast::<CustomPacket>() {
                if conn.write_packet(&*custom, true).is_err() {
                    break;
                }
            }
        }
    }

    async fn on_error(&self, conn: &Connection, error: EngineError) {
        warn!("connection {}: {}", conn.id(), error);
    }

    async fn on_failure(&self, conn: &Connection, error: EngineError) {
        error!("connection {} failed: {}", conn.id(), error);
    }

    async fn on_disconnect(&self, conn: &Connection) {
        let stats = conn.stats();
        info!(
            "connection {} closed ({} packets in, {} packets out)",
            conn.id(),
            stats.packets_received(),
            stats.packets_sent()
        );
    }
}

struct EchoServer {
    options: ServerOptions,
}

#[async_trait]
impl ServerListener for EchoServer {
    async fn new_connection_params(&self, _addr: SocketAddr) -> ConnectionParams {
        ConnectionParams {
            in_rate: self.options.in_rate,
            out_rate: self.options.out_rate,
            listener: Arc::new(EchoListener),
        }
    }

    async fn on_listen_failure(&self, addr: Option<SocketAddr>, error: EngineError) {
        match addr {
            Some(addr) => warn!("handshake with {} failed: {}", addr, error),
            None => warn!("listen failure: {}", error),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let options_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gamewire.json".to_string());
    let options = match ServerOptions::load(Path::new(&options_path)) {
        Ok(options) => {
            info!("loaded options from {}", options_path);
            options
        }
        Err(e) => {
            warn!("could not load {}: {}", options_path, e);
            warn!("using default options (port 14900)");
            ServerOptions::default()
        }
    };
    info!("options: {:?}", options);

    let config = ListenerConfig {
        bind_address: options.bind_address,
        max_connections: options.max_connections,
        user_version: options.user_version,
        ..Default::default()
    };

    let registry = Arc::new(PacketRegistry::new());
    let server = Arc::new(EchoServer { options });
    let listener = ServerConnectionListener::listen(config, server, registry).await?;
    info!("echo server ready on {}", listener.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");
    listener.shut_down().await;

    // Give in-flight disconnect events a moment to drain.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("bye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.bind_address.port(), 14900);
        assert_eq!(options.max_connections, 1000);
    }

    #[test]
    fn test_options_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"bind_address": "127.0.0.1:15000", "max_connections": 64}}"#
        )
        .unwrap();

        let options = ServerOptions::load(file.path()).unwrap();
        assert_eq!(options.bind_address.port(), 15000);
        assert_eq!(options.max_connections, 64);
        // Unspecified fields fall back to defaults.
        assert_eq!(options.user_version, 0);
    }

    #[test]
    fn test_missing_options_file_is_an_error() {
        assert!(ServerOptions::load(Path::new("/nonexistent/gamewire.json")).is_err());
    }
}
