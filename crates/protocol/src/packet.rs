//! The packet contract
//!
//! A packet is a self-describing message: a one-byte type tag, a four-byte
//! timestamp, and a body the implementation serializes field by field.
//! Instead of a class hierarchy there is one trait plus a tag-keyed factory
//! registry; the engine only ever handles `Box<dyn Packet>`.
//!
//! Tag space: 0-15 belong to the engine, 16-254 to the application, 255 is
//! the end-of-packets sentinel inside a frame.

use std::any::Any;
use std::sync::OnceLock;
use std::time::Instant;

use gamewire_core::Result;

use crate::raw::RawBuffer;

/// First tag available to application packets.
pub const USER_TAG_MIN: u8 = 16;

/// Last tag available to application packets.
pub const USER_TAG_MAX: u8 = 254;

/// End-of-packets marker within one frame.
pub const END_OF_PACKETS: u8 = 255;

/// Bytes of wire overhead per packet (tag byte + timestamp).
pub const PACKET_OVERHEAD: usize = 1 + 4;

/// A polymorphic, self-describing message
///
/// # Contract
/// `size_hint` must never under-report the serialized body size: the stream
/// uses it to decide whether a packet still fits into the current frame, and
/// an under-report means a buffer overflow panic at write time.
pub trait Packet: Send + Sync + std::fmt::Debug {
    /// The one-byte type tag
    fn type_tag(&self) -> u8;

    /// Milliseconds since engine start, stamped at construction
    fn timestamp(&self) -> u32;

    fn set_timestamp(&mut self, timestamp: u32);

    /// Upper bound on the serialized body size, in bytes
    fn size_hint(&self) -> usize;

    /// Clone into a fresh boxed packet (the stream enqueues clones)
    fn clone_packet(&self) -> Box<dyn Packet>;

    /// Serialize the body (everything after tag + timestamp)
    fn write_body(&self, buf: &mut RawBuffer);

    /// Deserialize the body into `self` (freshly built by the factory)
    fn read_body(&mut self, buf: &mut RawBuffer) -> Result<()>;

    /// Downcast support for typed reads
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A packet type with a statically known tag, usable with typed reads
pub trait TypedPacket: Packet + Sized + 'static {
    const TYPE_TAG: u8;
}

/// Serialize one packet (tag, timestamp, body) into a frame buffer
pub fn write_packet(packet: &dyn Packet, buf: &mut RawBuffer) {
    buf.write_u8(packet.type_tag());
    buf.write_u32(packet.timestamp());
    packet.write_body(buf);
}

/// Full wire size of a packet: header overhead plus the body bound
pub fn wire_size(packet: &dyn Packet) -> usize {
    PACKET_OVERHEAD + packet.size_hint()
}

/// Milliseconds elapsed since the first call in this process
///
/// Packet timestamps are relative to engine start, which keeps them small
/// and free of wall-clock jumps.
pub fn timestamp_now() -> u32 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic() {
        let a = timestamp_now();
        let b = timestamp_now();
        assert!(b >= a);
    }
}
