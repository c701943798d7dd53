//! Top-level configuration.
//!
//! Each section is owned by the crate it configures; this module stitches
//! them into one TOML document and validates the whole.

use std::path::Path;
use std::time::Duration;

use camlink_command_core::CorrelatorConfig;
use camlink_infra_common::LoggingSettings;
use camlink_stream_core::ReassemblyConfig;
use camlink_transport_core::TransportConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::recovery::RetryConfig;
use crate::session::MAX_UPLOAD_CHUNK_SIZE;

/// Session timing and queue sizes, the `[session]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session may stay in `Negotiating` before it fails
    pub negotiation_timeout_ms: u64,
    /// Wait for a stop acknowledgment before force-closing
    pub drain_grace_ms: u64,
    /// Per-device event queue between the inbound task and the handler
    pub event_queue_capacity: usize,
    /// Forward alarm notifications for newly seen devices
    pub auto_receive_alarm: bool,
    /// Bytes per upload chunk
    pub upload_chunk_size: usize,
    /// Redials before an interrupted download gives up
    pub reconnect_attempts: u32,
    /// First delay between redials, doubled after each failure
    pub reconnect_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 10_000,
            drain_grace_ms: 2_000,
            event_queue_capacity: 256,
            auto_receive_alarm: true,
            upload_chunk_size: 8_192,
            reconnect_attempts: 5,
            reconnect_delay_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn reconnect_retry(&self) -> RetryConfig {
        let initial_delay = Duration::from_millis(self.reconnect_delay_ms);
        RetryConfig {
            max_attempts: self.reconnect_attempts.max(1),
            initial_delay,
            max_delay: initial_delay * 16,
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamlinkConfig {
    pub transport: TransportConfig,
    pub command: CorrelatorConfig,
    pub session: SessionConfig,
    pub reassembly: ReassemblyConfig,
    pub logging: LoggingSettings,
}

impl CamlinkConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = camlink_infra_common::from_toml_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = camlink_infra_common::load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.command.validate()?;

        let session = &self.session;
        if session.negotiation_timeout_ms == 0 {
            return Err(Error::Config("negotiation_timeout_ms must be positive".into()));
        }
        if session.drain_grace_ms == 0 {
            return Err(Error::Config("drain_grace_ms must be positive".into()));
        }
        if session.event_queue_capacity == 0 {
            return Err(Error::Config("event_queue_capacity must be positive".into()));
        }
        if session.upload_chunk_size == 0 || session.upload_chunk_size > MAX_UPLOAD_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "upload_chunk_size must be within 1..={}, got {}",
                MAX_UPLOAD_CHUNK_SIZE, session.upload_chunk_size
            )));
        }

        let reassembly = &self.reassembly;
        if reassembly.max_pending_frames == 0 || reassembly.max_frame_bytes == 0 {
            return Err(Error::Config(
                "reassembly limits must be positive".into(),
            ));
        }

        camlink_infra_common::parse_log_level(&self.logging.level)?;
        Ok(())
    }

    /// Install the global subscriber described by the `[logging]` section.
    pub fn init_logging(&self) -> Result<()> {
        let logging = self.logging.to_config("camlink")?;
        camlink_infra_common::setup_logging(logging)?;
        Ok(())
    }
}
