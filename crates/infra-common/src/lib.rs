//! Common infrastructure for the camlink stack.
//!
//! - [`logging`]: `tracing` subscriber setup shared by binaries and tests
//! - [`config`]: TOML configuration loading
//! - [`errors`]: the error type used by the helpers in this crate

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{from_toml_str, load_toml};
pub use errors::{Error, Result};
pub use logging::{LoggingConfig, LoggingSettings, parse_log_level, setup_logging};
