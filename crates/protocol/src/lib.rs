//! # GameWire Protocol Library
//!
//! Wire-level building blocks for the engine:
//!
//! ### 1. Raw buffer ([`raw`])
//! Fixed-capacity frame buffer with typed little-endian codecs and
//! NUL-terminated strings.
//!
//! ### 2. Packet contract ([`packet`])
//! The [`Packet`] trait (tag + timestamp + body, clone, size bound) and the
//! tag-space constants. Packets are trait objects, not a class hierarchy.
//!
//! ### 3. Registry ([`registry`])
//! Explicit tag → factory map driving deserialization; engine tags 0-4 are
//! pre-registered, application tags live in 16-254, 255 is the in-frame
//! end-of-packets sentinel.
//!
//! ### 4. Control packets ([`control`])
//! Empty, custom raw-data, graceful-exit, rate-adjust and ping packets.
//!
//! ### 5. Handshake messages ([`handshake`])
//! Connect request/accept/refuse with version validation and refusal-code
//! mapping.

pub mod control;
pub mod handshake;
pub mod packet;
pub mod raw;
pub mod registry;

pub use control::{CustomPacket, EmptyPacket, ExitPacket, PingPacket, RateAdjustPacket};
pub use packet::{
    timestamp_now, wire_size, write_packet, Packet, TypedPacket, END_OF_PACKETS, PACKET_OVERHEAD,
    USER_TAG_MAX, USER_TAG_MIN,
};
pub use raw::{RawBuffer, RAW_BUFFER_SIZE};
pub use registry::{PacketFactory, PacketRegistry};
