use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Default time allowed for NAT hole-punching before relay fallback
pub const DEFAULT_P2P_TIMEOUT_MS: u64 = 6_000;

/// Upper bound accepted for the hole-punch timeout
pub const MAX_P2P_TIMEOUT_MS: u64 = 3_600_000;

/// Transport tuning, the `[transport]` section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Total time spent hole-punching
    pub p2p_timeout_ms: u64,

    /// Spacing between probes
    pub probe_interval_ms: u64,

    /// Probe budget within `p2p_timeout_ms`
    pub max_probes: u32,

    /// TCP connect timeout for relay and the answer window for LAN links
    pub connect_timeout_ms: u64,

    /// Keepalive period, zero disables heartbeats
    pub heartbeat_interval_ms: u64,

    /// Silence after which the peer is reported as heartbeat-lost
    pub heartbeat_timeout_ms: u64,

    /// Fall back to the relay when hole-punching fails under `TransportHint::Auto`
    pub allow_relay_fallback: bool,

    /// Route sub-stream watches through the relay
    pub force_substream_by_relay: bool,

    /// Inbound frames buffered between the socket reader and the consumer
    pub inbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            p2p_timeout_ms: DEFAULT_P2P_TIMEOUT_MS,
            probe_interval_ms: 500,
            max_probes: 12,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 20_000,
            allow_relay_fallback: true,
            force_substream_by_relay: false,
            inbound_capacity: 512,
        }
    }
}

impl TransportConfig {
    pub fn p2p_timeout(&self) -> Duration {
        Duration::from_millis(self.p2p_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Change the hole-punch timeout. Must be positive and below one hour.
    pub fn set_p2p_timeout(&mut self, timeout: Duration) -> Result<()> {
        let ms = timeout.as_millis() as u64;
        if ms == 0 || ms >= MAX_P2P_TIMEOUT_MS {
            return Err(Error::InvalidConfig(format!(
                "p2p timeout must be within (0, 3600s), got {:?}",
                timeout
            )));
        }
        self.p2p_timeout_ms = ms;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.p2p_timeout_ms == 0 || self.p2p_timeout_ms >= MAX_P2P_TIMEOUT_MS {
            return Err(Error::InvalidConfig(format!(
                "p2p_timeout_ms out of range: {}",
                self.p2p_timeout_ms
            )));
        }
        if self.max_probes == 0 {
            return Err(Error::InvalidConfig("max_probes must be at least 1".into()));
        }
        if self.probe_interval_ms == 0 {
            return Err(Error::InvalidConfig("probe_interval_ms must be positive".into()));
        }
        if self.inbound_capacity == 0 {
            return Err(Error::InvalidConfig("inbound_capacity must be positive".into()));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.p2p_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_set_p2p_timeout_bounds() {
        let mut config = TransportConfig::default();
        assert!(config.set_p2p_timeout(Duration::ZERO).is_err());
        assert!(config.set_p2p_timeout(Duration::from_secs(3600)).is_err());
        config.set_p2p_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(config.p2p_timeout_ms, 10_000);
    }

    #[test]
    fn test_heartbeat_disabled_with_zero_interval() {
        let config = TransportConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.heartbeat_interval().is_none());
        assert!(config.validate().is_ok());
    }
}
