//! Errors surfaced by the session layer.
//!
//! Every failure belongs to one [`ErrorCategory`]. Transport faults are
//! device-scoped and push sessions into `Error`; protocol faults are counted
//! and dropped where they occur and only reach callers through decoding
//! helpers; session faults are answers to the call that produced them;
//! resource faults are fatal to that call only.

use std::fmt;
use std::time::Duration;

use camlink_command_core::CommandCode;
use thiserror::Error;

use crate::session::SessionState;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Legacy integer codes, kept for interop with existing callers
pub mod legacy {
    pub const OUT_OF_MEMORY: i32 = -100;
    pub const INVALID_ADDR: i32 = -101;
    pub const SOCKET: i32 = -102;
    pub const NOT_FOUND: i32 = -103;
    pub const DEV_LOCK: i32 = -104;
    pub const USER_PASSWORD: i32 = -105;
    pub const INVALID_XML: i32 = -108;
    pub const RELAY_LOGIN: i32 = -109;
    pub const P2P_DISCONNECTED: i32 = -110;
    pub const P2P_AUTH: i32 = -111;
    pub const AUDIO_NOT_STARTED: i32 = -115;
    pub const RSP_TIMEOUT: i32 = -119;
    pub const REPLAY_NOT_ALLOWED: i32 = -120;
    pub const CHANNEL_OFFLINE: i32 = -121;
    pub const UNKNOWN: i32 = -200;
    pub const INVALID_PARAMETER: i32 = -202;
    pub const BUFFER_SMALL: i32 = -205;
    pub const DATA_FORMAT: i32 = -206;
    pub const NO_MORE_DATA: i32 = -208;
    pub const CHANNEL_UNCONNECTED: i32 = -224;
}

/// Device-scoped connectivity failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    #[error("invalid device address: {0}")]
    AddressInvalid(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("P2P authentication failed")]
    P2PAuthFailed,
    #[error("P2P path and relay unreachable")]
    P2PDisconnected,
    #[error("relay login failed: {0}")]
    RelayLoginFailed(String),
    #[error("endpoint closed")]
    EndpointClosed,
    #[error("heartbeat lost")]
    HeartbeatLost,
    #[error("no response to {code} after {attempts} attempts")]
    ResponseTimeout { code: CommandCode, attempts: u32 },
}

/// Malformed or unexpected traffic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed stream packet: {0}")]
    MalformedPacket(String),
    #[error("unexpected payload: {0}")]
    InvalidPayload(String),
    #[error("response with unknown correlation")]
    UnknownCorrelation,
    #[error("unexpected sequence gap")]
    UnexpectedGap,
}

/// Answers to a call that cannot be carried out as asked
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionFault {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("device is locked")]
    DevLocked,
    #[error("device rejected credentials")]
    AuthFailed,
    #[error("channel {0} is offline")]
    ChannelOffline(u16),
    #[error("channel {0} is not connected")]
    ChannelUnconnected(u16),
    #[error("device does not allow replay")]
    NotInReplayMode,
    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
    #[error("busy")]
    Busy,
    #[error("cancelled")]
    Cancelled,
    #[error("communication with the device is stopped")]
    CommunicationStopped,
    #[error("download offset rejected by device")]
    OffsetInvalid,
    #[error("device rejected request with code {0}")]
    Rejected(i32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Local resource exhaustion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceFault {
    #[error("buffer too small: required {required} bytes but only {available} available")]
    BufferTooSmall { required: usize, available: usize },
    #[error("out of memory")]
    OutOfMemory,
    #[error("queue full")]
    QueueFull,
}

/// Top-level error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(#[from] TransportFault),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolFault),
    #[error("session: {0}")]
    Session(#[from] SessionFault),
    #[error("resource: {0}")]
    Resource(#[from] ResourceFault),
    #[error("configuration: {0}")]
    Config(String),
}

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    SessionLogic,
    Resource,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::SessionLogic => "session",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transport(_) => ErrorCategory::Transport,
            Error::Protocol(_) => ErrorCategory::Protocol,
            Error::Session(_) => ErrorCategory::SessionLogic,
            Error::Resource(_) => ErrorCategory::Resource,
            Error::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Transport(fault) => !matches!(
                fault,
                TransportFault::AddressInvalid(_) | TransportFault::P2PAuthFailed
            ),
            Error::Protocol(_) => true,
            Error::Session(fault) => matches!(fault, SessionFault::Busy),
            Error::Resource(fault) => matches!(fault, ResourceFault::QueueFull),
            Error::Config(_) => false,
        }
    }

    /// Negative integer code of the legacy API
    pub fn legacy_code(&self) -> i32 {
        use legacy::*;
        match self {
            Error::Transport(fault) => match fault {
                TransportFault::AddressInvalid(_) => INVALID_ADDR,
                TransportFault::Socket(_) | TransportFault::EndpointClosed => SOCKET,
                TransportFault::HandshakeTimeout(_) | TransportFault::P2PDisconnected => P2P_DISCONNECTED,
                TransportFault::HeartbeatLost => P2P_DISCONNECTED,
                TransportFault::P2PAuthFailed => P2P_AUTH,
                TransportFault::RelayLoginFailed(_) => RELAY_LOGIN,
                TransportFault::ResponseTimeout { .. } => RSP_TIMEOUT,
            },
            Error::Protocol(_) => DATA_FORMAT,
            Error::Session(fault) => match fault {
                SessionFault::NotFound(_) => NOT_FOUND,
                SessionFault::DevLocked => DEV_LOCK,
                SessionFault::AuthFailed => USER_PASSWORD,
                SessionFault::ChannelOffline(_) => CHANNEL_OFFLINE,
                SessionFault::ChannelUnconnected(_) => CHANNEL_UNCONNECTED,
                SessionFault::NotInReplayMode => REPLAY_NOT_ALLOWED,
                SessionFault::OffsetInvalid => NO_MORE_DATA,
                SessionFault::InvalidArgument(_) => INVALID_PARAMETER,
                SessionFault::Rejected(code) if *code < 0 => *code,
                _ => UNKNOWN,
            },
            Error::Resource(fault) => match fault {
                ResourceFault::BufferTooSmall { .. } => BUFFER_SMALL,
                ResourceFault::OutOfMemory => OUT_OF_MEMORY,
                ResourceFault::QueueFull => UNKNOWN,
            },
            Error::Config(_) => INVALID_PARAMETER,
        }
    }

    /// Map a non-zero device result code onto a fault
    pub fn from_device_result(result: i32, channel: Option<u16>) -> Self {
        use legacy::*;
        let channel_no = channel.unwrap_or(0);
        let fault = match result {
            NOT_FOUND => SessionFault::NotFound("device".into()),
            DEV_LOCK => SessionFault::DevLocked,
            USER_PASSWORD | P2P_AUTH => SessionFault::AuthFailed,
            REPLAY_NOT_ALLOWED => SessionFault::NotInReplayMode,
            CHANNEL_OFFLINE => SessionFault::ChannelOffline(channel_no),
            CHANNEL_UNCONNECTED => SessionFault::ChannelUnconnected(channel_no),
            NO_MORE_DATA => SessionFault::OffsetInvalid,
            INVALID_PARAMETER => SessionFault::InvalidArgument("rejected by device".into()),
            other => SessionFault::Rejected(other),
        };
        Error::Session(fault)
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::Session(SessionFault::NotFound(what.into()))
    }

    pub fn invalid_state(state: SessionState, operation: &'static str) -> Self {
        Error::Session(SessionFault::InvalidState { state, operation })
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::Session(SessionFault::InvalidArgument(reason.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Session(SessionFault::Cancelled))
    }
}

impl From<camlink_transport_core::Error> for Error {
    fn from(err: camlink_transport_core::Error) -> Self {
        use camlink_transport_core::Error as T;
        match err {
            T::AddressInvalid(s) => TransportFault::AddressInvalid(s).into(),
            T::Socket(s) => TransportFault::Socket(s).into(),
            T::HandshakeTimeout(d) => TransportFault::HandshakeTimeout(d).into(),
            T::P2PAuthFailed => TransportFault::P2PAuthFailed.into(),
            T::P2PDisconnected => TransportFault::P2PDisconnected.into(),
            T::RelayLoginFailed(s) => TransportFault::RelayLoginFailed(s).into(),
            T::EndpointClosed => TransportFault::EndpointClosed.into(),
            T::HeartbeatLost => TransportFault::HeartbeatLost.into(),
            T::MalformedFrame(s) => ProtocolFault::MalformedFrame(s).into(),
            T::FrameTooLarge(n) => Error::invalid_argument(format!("frame body of {} bytes", n)),
            T::BufferTooSmall {
                required,
                available,
            } => ResourceFault::BufferTooSmall {
                required,
                available,
            }
            .into(),
            T::InboundTaken => Error::Session(SessionFault::Busy),
            T::InvalidConfig(s) => Error::Config(s),
        }
    }
}

impl From<camlink_command_core::Error> for Error {
    fn from(err: camlink_command_core::Error) -> Self {
        use camlink_command_core::Error as C;
        match err {
            C::ResponseTimeout { code, attempts } => {
                TransportFault::ResponseTimeout { code, attempts }.into()
            }
            C::Cancelled => SessionFault::Cancelled.into(),
            C::MalformedEnvelope(s) => ProtocolFault::MalformedEnvelope(s).into(),
            C::InvalidPayload(s) => ProtocolFault::InvalidPayload(s).into(),
            C::InvalidConfig(s) => Error::Config(s),
            C::Transport(e) => e.into(),
        }
    }
}

impl From<camlink_stream_core::Error> for Error {
    fn from(err: camlink_stream_core::Error) -> Self {
        use camlink_stream_core::Error as S;
        match err {
            S::BufferTooSmall {
                required,
                available,
            } => ResourceFault::BufferTooSmall {
                required,
                available,
            }
            .into(),
            S::PayloadTooLarge(n) => Error::invalid_argument(format!("payload of {} bytes", n)),
            other => ProtocolFault::MalformedPacket(other.to_string()).into(),
        }
    }
}

impl From<camlink_infra_common::Error> for Error {
    fn from(err: camlink_infra_common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        ProtocolFault::InvalidPayload(err.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_codes() {
        let cases: Vec<(Error, i32)> = vec![
            (TransportFault::AddressInvalid("x".into()).into(), -101),
            (TransportFault::Socket("x".into()).into(), -102),
            (Error::not_found("D1"), -103),
            (SessionFault::DevLocked.into(), -104),
            (TransportFault::RelayLoginFailed("x".into()).into(), -109),
            (TransportFault::P2PDisconnected.into(), -110),
            (TransportFault::P2PAuthFailed.into(), -111),
            (
                TransportFault::ResponseTimeout {
                    code: camlink_command_core::CommandCode::new(
                        camlink_command_core::MessageFamily::LiveStream,
                        42,
                    ),
                    attempts: 3,
                }
                .into(),
                -119,
            ),
            (SessionFault::NotInReplayMode.into(), -120),
            (SessionFault::ChannelOffline(2).into(), -121),
            (
                ResourceFault::BufferTooSmall {
                    required: 10,
                    available: 4,
                }
                .into(),
                -205,
            ),
            (SessionFault::ChannelUnconnected(1).into(), -224),
        ];
        for (error, code) in cases {
            assert_eq!(error.legacy_code(), code, "{}", error);
        }
    }

    #[test]
    fn test_categories_and_recoverability() {
        let timeout: Error = camlink_command_core::Error::Cancelled.into();
        assert_eq!(timeout.category(), ErrorCategory::SessionLogic);
        assert!(timeout.is_cancelled());
        assert!(!timeout.is_recoverable());

        let lost: Error = camlink_transport_core::Error::HeartbeatLost.into();
        assert_eq!(lost.category(), ErrorCategory::Transport);
        assert!(lost.is_recoverable());

        let auth: Error = camlink_transport_core::Error::P2PAuthFailed.into();
        assert!(!auth.is_recoverable());

        let small: Error = camlink_stream_core::Error::BufferTooSmall {
            required: 8,
            available: 2,
        }
        .into();
        assert_eq!(small.category(), ErrorCategory::Resource);
    }

    #[test]
    fn test_device_results() {
        assert_eq!(
            Error::from_device_result(-104, None),
            Error::Session(SessionFault::DevLocked)
        );
        assert_eq!(
            Error::from_device_result(-121, Some(3)),
            Error::Session(SessionFault::ChannelOffline(3))
        );
        assert_eq!(
            Error::from_device_result(-208, None),
            Error::Session(SessionFault::OffsetInvalid)
        );
        assert_eq!(
            Error::from_device_result(-77, None).legacy_code(),
            -77
        );
    }
}
