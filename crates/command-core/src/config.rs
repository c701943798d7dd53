use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::MessageFamily;
use crate::error::Error;
use crate::Result;

/// Correlator timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// How long each attempt waits for its response
    pub response_timeout_ms: u64,
    /// Total sends per request, including the first
    pub max_attempts: u32,
    /// Per-family overrides of `response_timeout_ms`, keyed by family name
    pub family_timeouts_ms: HashMap<String, u64>,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            max_attempts: 3,
            family_timeouts_ms: HashMap::new(),
        }
    }
}

impl CorrelatorConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Per-attempt timeout for `family`
    pub fn timeout_for(&self, family: MessageFamily) -> Duration {
        self.family_timeouts_ms
            .get(family.name())
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| self.response_timeout())
    }

    pub fn with_family_timeout(mut self, family: MessageFamily, timeout: Duration) -> Self {
        self.family_timeouts_ms
            .insert(family.name().to_string(), timeout.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            return Err(Error::InvalidConfig("response_timeout_ms must be positive".into()));
        }
        if self.max_attempts == 0 || self.max_attempts > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_attempts must be within 1..=10, got {}",
                self.max_attempts
            )));
        }
        for (name, ms) in &self.family_timeouts_ms {
            if MessageFamily::from_name(name).is_none() {
                return Err(Error::InvalidConfig(format!("unknown message family '{}'", name)));
            }
            if *ms == 0 {
                return Err(Error::InvalidConfig(format!("timeout for '{}' must be positive", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_override() {
        let config = CorrelatorConfig::default()
            .with_family_timeout(MessageFamily::NvrReplay, Duration::from_secs(8));
        assert_eq!(config.timeout_for(MessageFamily::NvrReplay), Duration::from_secs(8));
        assert_eq!(config.timeout_for(MessageFamily::ConfigGet), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = CorrelatorConfig::default();
        config.family_timeouts_ms.insert("nope".into(), 100);
        assert!(config.validate().is_err());

        let config = CorrelatorConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
