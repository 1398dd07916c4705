//! Core type definitions

use serde::{Deserialize, Serialize};

/// Engine wire-protocol version.
///
/// Bumped whenever the handshake or framing format changes. Both sides of a
/// handshake must agree on it exactly; the mismatch direction is reported so
/// the user knows which side needs upgrading.
pub const PROTOCOL_VERSION: u16 = 1;

/// Connection ID (32-bit unsigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for ConnectionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
