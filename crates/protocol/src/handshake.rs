//! Handshake wire messages
//!
//! The connection-establishment exchange rides the reliable channel as raw
//! frames, before any packet framing exists:
//!
//! ```text
//! ConnectRequest{engine, user, in_rate, out_rate, unreliable_port?}
//!     -> ConnectAccept{in_rate, out_rate, unreliable_port?}
//!      | ConnectRefuse{reason}
//! ```
//!
//! Each side advertises its own datagram port inside request/accept, so both
//! can connect their unreliable sockets once the accept lands. Rates are the
//! sender's requested inbound/outbound caps; each side derives its effective
//! outbound rate as `min(own requested out, peer's in)` with 0 meaning
//! unlimited.

use gamewire_core::{EngineError, Result, PROTOCOL_VERSION};

use crate::raw::RawBuffer;

const MSG_REQUEST: u8 = 0;
const MSG_ACCEPT: u8 = 1;
const MSG_REFUSE: u8 = 2;

/// Why a connection attempt was refused, as sent on the wire
///
/// Codes are phrased from the *requester's* point of view: `EngineTooLow`
/// tells the requester its engine is older than the accepter's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefuseReason {
    EngineTooLow = 0,
    EngineTooHigh = 1,
    UserTooLow = 2,
    UserTooHigh = 3,
    Refused = 4,
}

impl RefuseReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::EngineTooLow),
            1 => Some(Self::EngineTooHigh),
            2 => Some(Self::UserTooLow),
            3 => Some(Self::UserTooHigh),
            4 => Some(Self::Refused),
            _ => None,
        }
    }

    /// The error the refused requester should surface
    pub fn requester_error(self) -> EngineError {
        match self {
            Self::EngineTooLow => EngineError::EngineVersionTooLow,
            Self::EngineTooHigh => EngineError::EngineVersionTooHigh,
            Self::UserTooLow => EngineError::UserVersionTooLow,
            Self::UserTooHigh => EngineError::UserVersionTooHigh,
            Self::Refused => EngineError::Refused,
        }
    }

    /// The error the refusing accepter should report locally
    ///
    /// The mirror image of [`requester_error`](Self::requester_error): a peer
    /// whose engine is too low means ours is too high.
    pub fn accepter_error(self) -> EngineError {
        match self {
            Self::EngineTooLow => EngineError::EngineVersionTooHigh,
            Self::EngineTooHigh => EngineError::EngineVersionTooLow,
            Self::UserTooLow => EngineError::UserVersionTooHigh,
            Self::UserTooHigh => EngineError::UserVersionTooLow,
            Self::Refused => EngineError::Refused,
        }
    }
}

/// Opening message of the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub engine_version: u16,
    pub user_version: u32,
    /// Requested inbound cap in bytes/sec, 0 = unlimited
    pub in_rate: u32,
    /// Requested outbound cap in bytes/sec, 0 = unlimited
    pub out_rate: u32,
    /// Local datagram port if an unreliable channel is wanted
    pub unreliable_port: Option<u16>,
}

impl ConnectRequest {
    pub fn encode(&self, buf: &mut RawBuffer) {
        buf.write_u8(MSG_REQUEST);
        buf.write_u16(self.engine_version);
        buf.write_u32(self.user_version);
        buf.write_u32(self.in_rate);
        buf.write_u32(self.out_rate);
        match self.unreliable_port {
            Some(port) => {
                buf.write_u8(1);
                buf.write_u16(port);
            }
            None => buf.write_u8(0),
        }
    }

    pub fn decode(buf: &mut RawBuffer) -> Result<Self> {
        let msg = buf.read_u8()?;
        if msg != MSG_REQUEST {
            return Err(EngineError::Protocol(format!(
                "expected connect request, got message type {}",
                msg
            )));
        }
        let engine_version = buf.read_u16()?;
        let user_version = buf.read_u32()?;
        let in_rate = buf.read_u32()?;
        let out_rate = buf.read_u32()?;
        let unreliable_port = if buf.read_u8()? != 0 {
            Some(buf.read_u16()?)
        } else {
            None
        };
        Ok(Self {
            engine_version,
            user_version,
            in_rate,
            out_rate,
            unreliable_port,
        })
    }

    /// Validate versions against our own, from the accepter's seat
    ///
    /// Both the engine protocol version and the application version must
    /// match exactly; the mismatch direction picks the refusal code so each
    /// side learns which end needs upgrading.
    pub fn validate(&self, our_user_version: u32) -> std::result::Result<(), RefuseReason> {
        if self.engine_version < PROTOCOL_VERSION {
            return Err(RefuseReason::EngineTooLow);
        }
        if self.engine_version > PROTOCOL_VERSION {
            return Err(RefuseReason::EngineTooHigh);
        }
        if self.user_version < our_user_version {
            return Err(RefuseReason::UserTooLow);
        }
        if self.user_version > our_user_version {
            return Err(RefuseReason::UserTooHigh);
        }
        Ok(())
    }
}

/// Response to a valid request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAccept {
    /// Accepter's inbound cap, i.e. the requester's granted outbound rate
    pub in_rate: u32,
    /// Accepter's outbound cap
    pub out_rate: u32,
    /// Accepter's datagram port, if it agreed to the unreliable channel
    pub unreliable_port: Option<u16>,
}

impl ConnectAccept {
    pub fn encode(&self, buf: &mut RawBuffer) {
        buf.write_u8(MSG_ACCEPT);
        buf.write_u32(self.in_rate);
        buf.write_u32(self.out_rate);
        match self.unreliable_port {
            Some(port) => {
                buf.write_u8(1);
                buf.write_u16(port);
            }
            None => buf.write_u8(0),
        }
    }
}

/// Response to an invalid or unwanted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRefuse {
    pub reason: RefuseReason,
}

impl ConnectRefuse {
    pub fn encode(&self, buf: &mut RawBuffer) {
        buf.write_u8(MSG_REFUSE);
        buf.write_u8(self.reason as u8);
    }
}

/// What the requester hears back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectResponse {
    Accept(ConnectAccept),
    Refuse(ConnectRefuse),
}

impl ConnectResponse {
    pub fn decode(buf: &mut RawBuffer) -> Result<Self> {
        match buf.read_u8()? {
            MSG_ACCEPT => {
                let in_rate = buf.read_u32()?;
                let out_rate = buf.read_u32()?;
                let unreliable_port = if buf.read_u8()? != 0 {
                    Some(buf.read_u16()?)
                } else {
                    None
                };
                Ok(Self::Accept(ConnectAccept {
                    in_rate,
                    out_rate,
                    unreliable_port,
                }))
            }
            MSG_REFUSE => {
                let code = buf.read_u8()?;
                let reason = RefuseReason::from_u8(code).ok_or_else(|| {
                    EngineError::Protocol(format!("unknown refusal code {}", code))
                })?;
                Ok(Self::Refuse(ConnectRefuse { reason }))
            }
            other => Err(EngineError::Protocol(format!(
                "expected connect response, got message type {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let test_cases = vec![
            ConnectRequest {
                engine_version: PROTOCOL_VERSION,
                user_version: 7,
                in_rate: 16_000,
                out_rate: 8_000,
                unreliable_port: Some(40_001),
            },
            ConnectRequest {
                engine_version: PROTOCOL_VERSION,
                user_version: 0,
                in_rate: 0,
                out_rate: 0,
                unreliable_port: None,
            },
        ];

        for original in test_cases {
            let mut buf = RawBuffer::new();
            original.encode(&mut buf);
            let mut read = RawBuffer::from_bytes(buf.as_slice()).unwrap();
            let decoded = ConnectRequest::decode(&mut read).unwrap();
            assert_eq!(original, decoded);
        }
    }

    #[test]
    fn test_accept_roundtrip() {
        let accept = ConnectAccept {
            in_rate: 12_000,
            out_rate: 0,
            unreliable_port: Some(50_000),
        };
        let mut buf = RawBuffer::new();
        accept.encode(&mut buf);
        let mut read = RawBuffer::from_bytes(buf.as_slice()).unwrap();
        match ConnectResponse::decode(&mut read).unwrap() {
            ConnectResponse::Accept(decoded) => assert_eq!(accept, decoded),
            other => panic!("expected accept, got {:?}", other),
        }
    }

    #[test]
    fn test_refuse_roundtrip() {
        for reason in [
            RefuseReason::EngineTooLow,
            RefuseReason::EngineTooHigh,
            RefuseReason::UserTooLow,
            RefuseReason::UserTooHigh,
            RefuseReason::Refused,
        ] {
            let mut buf = RawBuffer::new();
            ConnectRefuse { reason }.encode(&mut buf);
            let mut read = RawBuffer::from_bytes(buf.as_slice()).unwrap();
            match ConnectResponse::decode(&mut read).unwrap() {
                ConnectResponse::Refuse(decoded) => assert_eq!(decoded.reason, reason),
                other => panic!("expected refuse, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_version_validation_directions() {
        let base = ConnectRequest {
            engine_version: PROTOCOL_VERSION,
            user_version: 2,
            in_rate: 0,
            out_rate: 0,
            unreliable_port: None,
        };

        assert!(base.validate(2).is_ok());
        assert_eq!(base.validate(3), Err(RefuseReason::UserTooLow));
        assert_eq!(base.validate(1), Err(RefuseReason::UserTooHigh));

        let old_engine = ConnectRequest {
            engine_version: 0,
            ..base.clone()
        };
        assert_eq!(old_engine.validate(2), Err(RefuseReason::EngineTooLow));
    }

    #[test]
    fn test_refusal_error_mapping_is_mirrored() {
        // Requester too old on the user version: it hears "too low", the
        // accepter logs "too high".
        let reason = RefuseReason::UserTooLow;
        assert!(matches!(
            reason.requester_error(),
            EngineError::UserVersionTooLow
        ));
        assert!(matches!(
            reason.accepter_error(),
            EngineError::UserVersionTooHigh
        ));
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let mut read = RawBuffer::from_bytes(&[9, 9, 9]).unwrap();
        assert!(ConnectResponse::decode(&mut read).is_err());
        let mut read = RawBuffer::from_bytes(&[1]).unwrap();
        assert!(ConnectResponse::decode(&mut read).is_err());
    }
}
