use std::fmt;

use camlink_transport_core::EndpointId;

use crate::envelope::{CommandCode, CommandEnvelope};

/// What a response is matched on: the endpoint it travels over, the command,
/// and the transparent channel when the command is passed through a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub channel: EndpointId,
    pub code: CommandCode,
    pub transparent: Option<u16>,
}

impl CorrelationKey {
    pub fn new(channel: EndpointId, code: CommandCode, transparent: Option<u16>) -> Self {
        Self {
            channel,
            code,
            transparent,
        }
    }

    pub fn for_envelope(channel: EndpointId, envelope: &CommandEnvelope) -> Self {
        Self::new(channel, envelope.code, envelope.route.transparent_channel())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transparent {
            Some(t) => write!(f, "{}:{}@{}", self.channel, self.code, t),
            None => write!(f, "{}:{}", self.channel, self.code),
        }
    }
}
