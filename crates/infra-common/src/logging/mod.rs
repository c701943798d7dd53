//! Logging setup for camlink binaries and tests.

mod setup;

pub use setup::{LoggingConfig, LoggingSettings, parse_log_level, setup_logging};
