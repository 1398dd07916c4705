//! # Synchronous Facade
//!
//! `SyncConnection` lets calling code drive a connection with blocking-style
//! typed reads and writes while the async core keeps running underneath,
//! without losing any event across the mode switch.
//!
//! Wrapping flips the connection's listener slot from `Async` to
//! `SyncWrapped` (an explicit state transition, not pointer games). While
//! wrapped:
//!
//! - receive events wake blocked [`recv`](SyncConnection::recv) calls
//!   instead of reaching the original listener, unless the facade has
//!   already been released, in which case they forward (that is the race
//!   between release and an inbound event, handled here);
//! - connect-class events always pass straight through;
//! - failures and errors are captured into a single error slot and surfaced
//!   on the caller's next blocking call; a fatal failure auto-releases the
//!   facade so the original listener is back in place to observe the
//!   disconnect that follows.
//!
//! Releasing restores the original listener, and if undrained data remains,
//! synthesizes one receive event so it is not lost. Releasing twice is a
//! no-op; dropping the facade releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use gamewire_core::{EngineError, Result};
use gamewire_protocol::{Packet, TypedPacket};

use crate::conn::Connection;
use crate::listener::ConnectionListener;

/// The wrapped-mode listener installed into the connection
///
/// Lives as long as either the facade or the connection's listener slot
/// references it.
pub(crate) struct SyncCore {
    original: Arc<dyn ConnectionListener>,
    released: AtomicBool,
    /// First captured failure/error; later ones are dropped
    error: Mutex<Option<EngineError>>,
    wake: Notify,
}

impl SyncCore {
    pub(crate) fn new(original: Arc<dyn ConnectionListener>) -> Self {
        Self {
            original,
            released: AtomicBool::new(false),
            error: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn set_error(&self, error: EngineError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take_error(&self) -> Option<EngineError> {
        self.error.lock().take()
    }

    fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Restore the original listener; used by both explicit release and the
    /// auto-release on fatal failure
    fn do_release(&self, conn: &Connection) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        conn.restore_listener();
        if conn.incoming_len() > 0 {
            // Data arrived while wrapped and was never drained: hand the
            // original listener a receive event so it is not lost.
            conn.events.signal_receive();
        }
        self.wake.notify_one();
        true
    }
}

#[async_trait]
impl ConnectionListener for SyncCore {
    async fn on_connect(&self, conn: &Connection) {
        self.original.on_connect(conn).await;
    }

    async fn on_new_conn(&self, conn: &Connection) {
        self.original.on_new_conn(conn).await;
    }

    async fn on_receive(&self, conn: &Connection) {
        if self.is_released() {
            // Released concurrently with an inbound event: forward.
            self.original.on_receive(conn).await;
        } else {
            self.wake.notify_one();
        }
    }

    async fn on_done_writing(&self, conn: &Connection) {
        if self.is_released() {
            self.original.on_done_writing(conn).await;
        }
    }

    async fn on_error(&self, conn: &Connection, error: EngineError) {
        if self.is_released() {
            self.original.on_error(conn, error).await;
        } else {
            self.set_error(error);
            self.wake.notify_one();
        }
    }

    async fn on_failure(&self, conn: &Connection, error: EngineError) {
        // Captured, not forwarded; the auto-release puts the original
        // listener back in control before the disconnect event lands.
        self.set_error(error);
        self.do_release(conn);
    }

    async fn on_disconnect(&self, conn: &Connection) {
        if !self.is_released() {
            self.set_error(EngineError::NotConnected);
            self.do_release(conn);
        }
        self.original.on_disconnect(conn).await;
    }
}

/// Blocking-style typed send/receive over an async connection
///
/// One blocked reader at a time; this facade is meant for linear,
/// conversation-shaped code.
///
/// # Example
///
/// ```rust,no_run
/// use gamewire_network::SyncConnection;
/// use gamewire_protocol::CustomPacket;
///
/// # async fn example(conn: &std::sync::Arc<gamewire_network::Connection>) -> gamewire_core::Result<()> {
/// let sync = SyncConnection::wrap(conn)?;
/// sync.send(&CustomPacket::new(b"hello".to_vec()))?;
/// let reply: CustomPacket = sync.recv().await?;
/// sync.release()?;
/// # Ok(())
/// # }
/// ```
pub struct SyncConnection {
    conn: Arc<Connection>,
    core: Arc<SyncCore>,
}

impl SyncConnection {
    /// Intercept the connection's event flow
    ///
    /// # Errors
    /// Fails if the connection is already wrapped.
    pub fn wrap(conn: &Arc<Connection>) -> Result<Self> {
        let core = conn.wrap_listener()?;
        Ok(Self {
            conn: conn.clone(),
            core,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Receive the next packet, requiring it to be exactly a `P`
    ///
    /// Blocks until data or an error arrives. A packet of any other type is
    /// discarded and reported as `TypeMismatch`; the connection stays
    /// usable, as does the facade.
    pub async fn recv<P: TypedPacket>(&self) -> Result<P> {
        loop {
            if let Some(error) = self.core.take_error() {
                return Err(error);
            }
            if self.core.is_released() {
                return Err(EngineError::SyncReleased);
            }
            if let Some(packet) = self.conn.next_packet() {
                let got = packet.type_tag();
                if got != P::TYPE_TAG {
                    return Err(EngineError::TypeMismatch {
                        expected: P::TYPE_TAG,
                        got,
                    });
                }
                return match packet.into_any().downcast::<P>() {
                    Ok(packet) => Ok(*packet),
                    // Tag matched but the registry built something else:
                    // the registration itself is broken.
                    Err(_) => Err(EngineError::Protocol(format!(
                        "registry factory for tag {} built a different type",
                        got
                    ))),
                };
            }

            let notified = self.core.wake.notified();
            if self.core.has_error()
                || self.core.is_released()
                || self.conn.incoming_len() > 0
            {
                continue;
            }
            notified.await;
        }
    }

    /// Send a packet on the reliable channel
    ///
    /// Does not block (the stream's writer task does the actual sending)
    /// but surfaces any already-captured error synchronously.
    pub fn send(&self, packet: &dyn Packet) -> Result<()> {
        if let Some(error) = self.core.take_error() {
            return Err(error);
        }
        if self.core.is_released() {
            return Err(EngineError::SyncReleased);
        }
        self.conn.write_packet(packet, true)
    }

    /// Restore the original listener; idempotent
    ///
    /// Returns the captured error, if any, except the released sentinel,
    /// which is the expected terminal state rather than a fault.
    pub fn release(&self) -> Result<()> {
        self.core.do_release(&self.conn);
        match self.core.take_error() {
            None | Some(EngineError::SyncReleased) => Ok(()),
            Some(error) => Err(error),
        }
    }
}

impl Drop for SyncConnection {
    fn drop(&mut self) {
        self.core.do_release(&self.conn);
    }
}
