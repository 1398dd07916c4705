//! Connection ID generation

use std::sync::atomic::{self, AtomicU32};

/// Thread-safe monotonic ID generator for connections
///
/// IDs are never reused within a process; 32 bits is enough headroom that
/// wraparound is not a practical concern for a connection counter.
pub struct IdGenerator {
    next_id: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
        }
    }

    /// Get the next available ID
    pub fn next(&self) -> u32 {
        self.next_id.fetch_add(1, atomic::Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
