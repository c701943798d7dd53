//! Control commands for camlink devices.
//!
//! Commands travel as [`CommandEnvelope`]s inside control frames. The
//! [`CommandCorrelator`] keeps the table of requests waiting for a response,
//! queues requests that share a [`CorrelationKey`], retries on silence and
//! wakes waiters with [`Error::Cancelled`] when their session or endpoint
//! goes away.

pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod key;

pub use config::CorrelatorConfig;
pub use correlator::{CommandCorrelator, CommandSink, OwnerId, PendingCommand, RequestOptions};
pub use envelope::{CommandCode, CommandEnvelope, EnvelopeKind, MessageFamily, Route};
pub use error::Error;
pub use key::CorrelationKey;

/// Result type for command operations
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CommandCode, CommandCorrelator, CommandEnvelope, CommandSink, CorrelationKey,
        CorrelatorConfig, EnvelopeKind, Error, MessageFamily, RequestOptions, Result, Route,
    };
}
