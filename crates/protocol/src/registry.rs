//! Packet type registry
//!
//! Maps type tags to factories producing blank packets for deserialization.
//! The registry is an explicit, process-scoped object shared as
//! `Arc<PacketRegistry>`; connections never reach for ambient global state.
//! It is append-only: there is no unregister.

use std::collections::HashMap;

use parking_lot::Mutex;

use gamewire_core::{EngineError, Result};

use crate::control::{CustomPacket, EmptyPacket, ExitPacket, PingPacket, RateAdjustPacket};
use crate::packet::{Packet, END_OF_PACKETS, USER_TAG_MAX, USER_TAG_MIN};
use crate::raw::RawBuffer;

/// Zero-argument factory producing an uninitialized packet
pub type PacketFactory = fn() -> Box<dyn Packet>;

/// Tag → factory map driving deserialization
///
/// # Thread Safety
/// Internally locked; registration and parsing may happen from any task.
/// Registration is expected at startup, before connections exist.
pub struct PacketRegistry {
    factories: Mutex<HashMap<u8, PacketFactory>>,
}

impl PacketRegistry {
    /// Create a registry with the engine control packets pre-registered
    pub fn new() -> Self {
        let mut factories: HashMap<u8, PacketFactory> = HashMap::new();
        factories.insert(EmptyPacket::TAG, || Box::new(EmptyPacket::default()));
        factories.insert(CustomPacket::TAG, || Box::new(CustomPacket::default()));
        factories.insert(ExitPacket::TAG, || Box::new(ExitPacket::default()));
        factories.insert(RateAdjustPacket::TAG, || {
            Box::new(RateAdjustPacket::default())
        });
        factories.insert(PingPacket::TAG, || Box::new(PingPacket::default()));
        Self {
            factories: Mutex::new(factories),
        }
    }

    /// Register an application packet type
    ///
    /// # Panics
    /// Registering outside [16,254] or registering a tag twice is a contract
    /// violation and panics.
    pub fn register(&self, tag: u8, factory: PacketFactory) {
        assert!(
            (USER_TAG_MIN..=USER_TAG_MAX).contains(&tag),
            "application packet tags must be in [{}, {}], got {}",
            USER_TAG_MIN,
            USER_TAG_MAX,
            tag
        );
        let mut factories = self.factories.lock();
        let previous = factories.insert(tag, factory);
        assert!(previous.is_none(), "packet tag {} registered twice", tag);
        tracing::debug!("registered packet type {}", tag);
    }

    /// Whether a tag has a registered factory
    pub fn is_registered(&self, tag: u8) -> bool {
        self.factories.lock().contains_key(&tag)
    }

    /// Parse the next packet out of a frame
    ///
    /// # Returns
    /// - `Ok(Some(packet))`: one packet decoded, cursor advanced past it
    /// - `Ok(None)`: the end-of-packets sentinel; the frame is exhausted
    /// - `Err(UnknownPacket)`: unregistered tag; the caller must discard
    ///   the remainder of the frame as untrustworthy
    pub fn parse_next(&self, buf: &mut RawBuffer) -> Result<Option<Box<dyn Packet>>> {
        let tag = buf.read_u8()?;
        if tag == END_OF_PACKETS {
            return Ok(None);
        }

        let factory = {
            let factories = self.factories.lock();
            factories.get(&tag).copied()
        };
        let factory = factory.ok_or(EngineError::UnknownPacket(tag))?;

        let timestamp = buf.read_u32()?;
        let mut packet = factory();
        packet.read_body(buf)?;
        packet.set_timestamp(timestamp);
        Ok(Some(packet))
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
