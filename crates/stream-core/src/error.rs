use thiserror::Error;

/// Error type for stream packet handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer too small for the operation
    #[error("Buffer too small: required {required} bytes but only {available} available")]
    BufferTooSmall { required: usize, available: usize },

    /// A header field holds a value outside its domain
    #[error("Invalid stream packet: {0}")]
    InvalidPacket(String),

    /// Declared payload size disagrees with the bytes present
    #[error("Payload length mismatch: header says {declared}, got {actual}")]
    PayloadLength { declared: usize, actual: usize },

    /// Payload does not fit in a single packet's 16-bit size field
    #[error("Payload too large for one packet: {0} bytes")]
    PayloadTooLarge(usize),
}
