//! Core error types for GameWire
//!
//! One taxonomy for the whole engine. Handshake errors are returned
//! synchronously to the initiating call; once a connection is established,
//! errors travel only through the per-connection event dispatcher; they are
//! never thrown across a task boundary.

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// A local socket could not be allocated or bound.
    #[error("could not open socket: {0}")]
    CouldNotOpenSocket(#[source] std::io::Error),

    /// Low-level transport error, wrapping the underlying system error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A connection attempt or drain exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Malformed handshake or framing data from the peer.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer refused the connection outright (server full, policy).
    #[error("connection refused by peer")]
    Refused,

    /// Our engine protocol version is older than the peer's.
    #[error("local engine protocol version is too old for peer")]
    EngineVersionTooLow,

    /// Our engine protocol version is newer than the peer's.
    #[error("local engine protocol version is too new for peer")]
    EngineVersionTooHigh,

    /// Our application-level version is older than the peer's.
    #[error("local application version is too old for peer")]
    UserVersionTooLow,

    /// Our application-level version is newer than the peer's.
    #[error("local application version is too new for peer")]
    UserVersionTooHigh,

    /// The peer vanished without the graceful close notice.
    #[error("peer disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// A frame carried a type tag nothing is registered for. The rest of
    /// that frame is untrustworthy and gets discarded.
    #[error("unknown packet type {0}")]
    UnknownPacket(u8),

    /// A typed synchronous read got a packet of the wrong type. The packet
    /// is discarded; the connection stays usable.
    #[error("packet type mismatch: expected tag {expected}, got tag {got}")]
    TypeMismatch { expected: u8, got: u8 },

    /// Sentinel: the synchronous facade has been released. Expected terminal
    /// state, not a real fault.
    #[error("synchronous wrapper already released")]
    SyncReleased,

    /// Send/receive on a connection that is not (or no longer) connected.
    #[error("connection is not connected")]
    NotConnected,

    /// Data that does not decode (truncated buffer, bad string, etc.).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether this error forces a disconnect when it surfaces during
    /// steady-state operation.
    ///
    /// Non-fatal errors (a corrupted packet inside an otherwise healthy
    /// stream, a typed-read mismatch) are reported once and the stream
    /// continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::UnknownPacket(_)
                | EngineError::TypeMismatch { .. }
                | EngineError::InvalidData(_)
                | EngineError::SyncReleased
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
