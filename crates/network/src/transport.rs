//! Transport abstraction
//!
//! The engine consumes transports as an opaque frame interface: one call
//! sends a whole frame, one call receives a whole frame, and nothing above
//! this layer knows how framing happens on the wire.
//!
//! Two implementations:
//! - [`TcpTransport`]: the reliable, ordered channel. Frames are prefixed
//!   with a 2-byte big-endian length.
//! - [`UdpTransport`]: the optional unreliable channel. One datagram is one
//!   frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex as TokioMutex;

use gamewire_core::{EngineError, Result};
use gamewire_protocol::RAW_BUFFER_SIZE;

/// A bidirectional, frame-oriented channel
///
/// # Thread Safety
/// `send` and `recv` may be called from different tasks concurrently;
/// concurrent calls to the same method serialize internally.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Send one frame (at most [`RAW_BUFFER_SIZE`] bytes)
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive one frame
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Stop the channel; a closed transport fails all further sends
    async fn close(&self);

    fn local_addr(&self) -> Result<SocketAddr>;

    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// Reliable channel over TCP with 2-byte big-endian length framing
pub struct TcpTransport {
    reader: TokioMutex<OwnedReadHalf>,
    writer: TokioMutex<OwnedWriteHalf>,
    local: SocketAddr,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: TokioMutex::new(reader),
            writer: TokioMutex::new(writer),
            local,
            peer,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FrameTransport for TcpTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        debug_assert!(frame.len() <= RAW_BUFFER_SIZE);
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&(frame.len() as u16).to_be_bytes()).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 2];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(EngineError::UnexpectedDisconnect);
            }
            return Err(EngineError::Io(e));
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        if len > RAW_BUFFER_SIZE {
            return Err(EngineError::Protocol(format!(
                "peer announced a {} byte frame, limit is {}",
                len, RAW_BUFFER_SIZE
            )));
        }

        let mut frame = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut frame).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(EngineError::UnexpectedDisconnect);
            }
            return Err(EngineError::Io(e));
        }
        Ok(frame)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.peer)
    }
}

/// Unreliable channel over a connected UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Wrap an already-connected socket
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FrameTransport for UdpTransport {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        debug_assert!(frame.len() <= RAW_BUFFER_SIZE);
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::NotConnected);
        }
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        // Oversized datagrams are truncated by the OS; anything past the
        // frame limit could not have come from this engine anyway and will
        // fail packet parsing upstream.
        let mut buf = vec![0u8; RAW_BUFFER_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.peer_addr()?)
    }
}
