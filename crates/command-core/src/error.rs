use thiserror::Error;

use crate::envelope::CommandCode;

/// Error type for command correlation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No matching response after every attempt
    #[error("No response to {code} after {attempts} attempts")]
    ResponseTimeout { code: CommandCode, attempts: u32 },

    /// The request was cancelled by its owner or by endpoint teardown
    #[error("Command cancelled")]
    Cancelled,

    /// A control envelope could not be decoded or encoded
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Payload is not the JSON the caller expected
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Out-of-range correlator setting
    #[error("Invalid command configuration: {0}")]
    InvalidConfig(String),

    /// Sending the request failed at the transport
    #[error("Transport error: {0}")]
    Transport(#[from] camlink_transport_core::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidPayload(err.to_string())
    }
}
