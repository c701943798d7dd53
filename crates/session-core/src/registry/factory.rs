use async_trait::async_trait;
use camlink_transport_core::{Endpoint, TransportConfig, TransportHint};
use tracing::debug;

use crate::device::DeviceRecord;
use crate::errors::Result;

/// Creates the endpoint for a device on its first session
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn connect(&self, record: &DeviceRecord, hint: TransportHint, config: &TransportConfig) -> Result<Endpoint>;
}

/// Opens real P2P, relay or LAN connections
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkEndpointFactory;

#[async_trait]
impl EndpointFactory for NetworkEndpointFactory {
    async fn connect(&self, record: &DeviceRecord, hint: TransportHint, config: &TransportConfig) -> Result<Endpoint> {
        debug!(device_id = %record.device_id(), %hint, "opening endpoint");
        Ok(camlink_transport_core::open(&record.address, hint, config).await?)
    }
}
