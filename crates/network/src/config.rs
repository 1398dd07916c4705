//! # Connection and Listener Configuration
//!
//! Configuration options for the GameWire networking layer.
//!
//! # Example
//!
//! ```rust
//! use gamewire_network::ConnectionConfig;
//! use std::time::Duration;
//!
//! let config = ConnectionConfig {
//!     user_version: 1,
//!     requested_out_rate: 32_000,
//!     connect_timeout: Duration::from_secs(5),
//!     ..Default::default()
//! };
//! ```

use std::net::SocketAddr;
use std::time::Duration;

/// Options for one outbound connection
///
/// # Default Values
/// - No rate limits (0 = unlimited in both directions)
/// - Unreliable channel requested
/// - 10-second connect timeout
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Application-level version; both sides must match exactly
    pub user_version: u32,

    /// Requested inbound cap in bytes/sec (what we grant the peer), 0 = unlimited
    pub requested_in_rate: u32,

    /// Requested outbound cap in bytes/sec, 0 = unlimited
    pub requested_out_rate: u32,

    /// Whether to negotiate the unreliable datagram channel
    pub unreliable: bool,

    /// Deadline for the whole handshake exchange
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user_version: 0,
            requested_in_rate: 0,
            requested_out_rate: 0,
            unreliable: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Validate the configuration
    ///
    /// # Checks
    /// - `connect_timeout` must be non-zero
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Options for an accepting endpoint
///
/// # Default Values
/// - Listen on all interfaces, OS-assigned port
/// - 1000 max connections
/// - Unreliable channel negotiation allowed
/// - 10-second handshake deadline per attempt
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address and port to bind the TCP listener to
    pub bind_address: SocketAddr,

    /// Application-level version; connecting peers must match exactly
    pub user_version: u32,

    /// Maximum number of concurrent connections allowed
    ///
    /// Attempts past the limit are refused during their handshake.
    pub max_connections: usize,

    /// Whether peers may negotiate the unreliable datagram channel
    pub unreliable: bool,

    /// Deadline for each inbound handshake
    ///
    /// A peer that connects and then stalls is cut off after this long; it
    /// never blocks other handshakes either way, but this bounds the
    /// half-open state.
    pub handshake_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".parse().unwrap(),
            user_version: 0,
            max_connections: 1000,
            unreliable: true,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ListenerConfig {
    /// Validate the configuration
    ///
    /// # Checks
    /// - `max_connections` must be > 0
    /// - `handshake_timeout` must be non-zero
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.requested_in_rate, 0);
        assert_eq!(config.requested_out_rate, 0);
        assert!(config.unreliable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_listener_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_max_connections() {
        let mut config = ListenerConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_connect_timeout() {
        let mut config = ConnectionConfig::default();
        config.connect_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
