use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The device address is missing, unspecified or unusable for the requested path
    #[error("Invalid device address: {0}")]
    AddressInvalid(String),

    /// Socket creation, bind, connect or I/O failure
    #[error("Socket error: {0}")]
    Socket(String),

    /// No answer during connection establishment
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The device answered hole-punch probes with an authentication rejection
    #[error("P2P authentication rejected by device")]
    P2PAuthFailed,

    /// Neither the direct path nor the relay could be reached
    #[error("P2P path unreachable and relay unavailable")]
    P2PDisconnected,

    /// The relay broker refused the session instance
    #[error("Relay server login failed: {0}")]
    RelayLoginFailed(String),

    /// Operation attempted on a closed endpoint
    #[error("Endpoint closed")]
    EndpointClosed,

    /// The peer stopped answering heartbeats
    #[error("Heartbeat lost")]
    HeartbeatLost,

    /// A received unit could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame body does not fit the 16-bit length field
    #[error("Frame body too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Caller-supplied buffer cannot hold the data
    #[error("Buffer too small: required {required} bytes but only {available} available")]
    BufferTooSmall { required: usize, available: usize },

    /// The inbound stream of an endpoint can only be taken once
    #[error("Inbound stream already taken")]
    InboundTaken,

    /// Out-of-range transport setting
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Socket(err.to_string())
    }
}
