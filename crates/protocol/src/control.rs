//! Engine control packets (reserved tags 0-4)
//!
//! These ride the same streams as application packets but are produced and
//! consumed by the engine itself. `Custom` is the one exception: it is a
//! free-form payload carrier handed through to the application, for code
//! that does not want to define its own packet types.

use std::any::Any;

use gamewire_core::{EngineError, Result};

use crate::packet::{timestamp_now, Packet, TypedPacket};
use crate::raw::{RawBuffer, RAW_BUFFER_SIZE};

/// The empty packet: a tag and a timestamp, nothing else
///
/// Useful as a keepalive or as a minimal application-level signal.
#[derive(Debug, Clone)]
pub struct EmptyPacket {
    timestamp: u32,
}

impl EmptyPacket {
    pub const TAG: u8 = 0;

    pub fn new() -> Self {
        Self {
            timestamp: timestamp_now(),
        }
    }
}

impl Default for EmptyPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet for EmptyPacket {
    fn type_tag(&self) -> u8 {
        Self::TAG
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    fn size_hint(&self) -> usize {
        0
    }

    fn clone_packet(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }

    fn write_body(&self, _buf: &mut RawBuffer) {}

    fn read_body(&mut self, _buf: &mut RawBuffer) -> Result<()> {
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl TypedPacket for EmptyPacket {
    const TYPE_TAG: u8 = Self::TAG;
}

/// Free-form raw-data packet
///
/// Carries an opaque byte payload with a two-byte length marker. The payload
/// is capped so the whole packet always fits one frame.
#[derive(Debug, Clone)]
pub struct CustomPacket {
    timestamp: u32,
    data: Vec<u8>,
}

impl CustomPacket {
    pub const TAG: u8 = 1;

    /// Maximum payload: one frame minus packet header, length marker, and
    /// the frame sentinel.
    pub const MAX_DATA: usize = RAW_BUFFER_SIZE - 1 - 4 - 2 - 1;

    pub fn new(data: Vec<u8>) -> Self {
        assert!(
            data.len() <= Self::MAX_DATA,
            "custom packet payload of {} bytes exceeds the {} byte limit",
            data.len(),
            Self::MAX_DATA
        );
        Self {
            timestamp: timestamp_now(),
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl Default for CustomPacket {
    fn default() -> Self {
        Self {
            timestamp: timestamp_now(),
            data: Vec::new(),
        }
    }
}

impl Packet for CustomPacket {
    fn type_tag(&self) -> u8 {
        Self::TAG
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    fn size_hint(&self) -> usize {
        2 + self.data.len()
    }

    fn clone_packet(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }

    fn write_body(&self, buf: &mut RawBuffer) {
        buf.write_u16(self.data.len() as u16);
        buf.write_raw(&self.data);
    }

    fn read_body(&mut self, buf: &mut RawBuffer) -> Result<()> {
        let len = buf.read_u16()? as usize;
        if len > Self::MAX_DATA {
            return Err(EngineError::InvalidData(format!(
                "custom packet claims {} bytes, limit is {}",
                len,
                Self::MAX_DATA
            )));
        }
        self.data = buf.read_raw(len)?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl TypedPacket for CustomPacket {
    const TYPE_TAG: u8 = Self::TAG;
}

/// Graceful-close notice
///
/// Sent ahead of teardown by a drain-then-disconnect so the peer can tell a
/// clean goodbye from a dead socket.
#[derive(Debug, Clone)]
pub struct ExitPacket {
    timestamp: u32,
}

impl ExitPacket {
    pub const TAG: u8 = 2;

    pub fn new() -> Self {
        Self {
            timestamp: timestamp_now(),
        }
    }
}

impl Default for ExitPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet for ExitPacket {
    fn type_tag(&self) -> u8 {
        Self::TAG
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    fn size_hint(&self) -> usize {
        0
    }

    fn clone_packet(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }

    fn write_body(&self, _buf: &mut RawBuffer) {}

    fn read_body(&mut self, _buf: &mut RawBuffer) -> Result<()> {
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl TypedPacket for ExitPacket {
    const TYPE_TAG: u8 = Self::TAG;
}

/// Flow-control notice: the sender's new inbound cap
///
/// The receiver treats the carried value as its granted outbound rate and
/// recomputes its effective rate from it.
#[derive(Debug, Clone)]
pub struct RateAdjustPacket {
    timestamp: u32,
    rate: u32,
}

impl RateAdjustPacket {
    pub const TAG: u8 = 3;

    pub fn new(rate: u32) -> Self {
        Self {
            timestamp: timestamp_now(),
            rate,
        }
    }

    /// The new granted rate in bytes/sec; 0 means unlimited
    pub fn rate(&self) -> u32 {
        self.rate
    }
}

impl Default for RateAdjustPacket {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Packet for RateAdjustPacket {
    fn type_tag(&self) -> u8 {
        Self::TAG
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    fn size_hint(&self) -> usize {
        4
    }

    fn clone_packet(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }

    fn write_body(&self, buf: &mut RawBuffer) {
        buf.write_u32(self.rate);
    }

    fn read_body(&mut self, buf: &mut RawBuffer) -> Result<()> {
        self.rate = buf.read_u32()?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl TypedPacket for RateAdjustPacket {
    const TYPE_TAG: u8 = Self::TAG;
}

/// Ping request/reply
///
/// The engine answers requests in the reader path; a reply carrying a nonce
/// we remember yields a round-trip measurement.
#[derive(Debug, Clone)]
pub struct PingPacket {
    timestamp: u32,
    is_reply: bool,
    nonce: u32,
}

impl PingPacket {
    pub const TAG: u8 = 4;

    pub fn request(nonce: u32) -> Self {
        Self {
            timestamp: timestamp_now(),
            is_reply: false,
            nonce,
        }
    }

    /// Build the reply to a received request, echoing its nonce
    pub fn reply_to(request: &PingPacket) -> Self {
        Self {
            timestamp: timestamp_now(),
            is_reply: true,
            nonce: request.nonce,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.is_reply
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }
}

impl Default for PingPacket {
    fn default() -> Self {
        Self::request(0)
    }
}

impl Packet for PingPacket {
    fn type_tag(&self) -> u8 {
        Self::TAG
    }

    fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    fn size_hint(&self) -> usize {
        1 + 4
    }

    fn clone_packet(&self) -> Box<dyn Packet> {
        Box::new(self.clone())
    }

    fn write_body(&self, buf: &mut RawBuffer) {
        buf.write_u8(self.is_reply as u8);
        buf.write_u32(self.nonce);
    }

    fn read_body(&mut self, buf: &mut RawBuffer) -> Result<()> {
        self.is_reply = buf.read_u8()? != 0;
        self.nonce = buf.read_u32()?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl TypedPacket for PingPacket {
    const TYPE_TAG: u8 = Self::TAG;
}
