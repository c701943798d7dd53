//! What the session layer knows about devices.
//!
//! Login and discovery happen elsewhere; a [`DeviceDirectory`] hands the
//! registry a [`DeviceRecord`] for a device id. From then on the registry
//! keeps a [`DeviceInfo`] that status notifications update.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use camlink_command_core::{MessageFamily, Route};
use camlink_transport_core::{DeviceAddress, TransportKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result, SessionFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Ipc,
    WifiIpc,
    NvrV1,
    NvrV4,
}

impl DeviceType {
    pub fn code(self) -> u16 {
        match self {
            DeviceType::Ipc => 100,
            DeviceType::WifiIpc => 101,
            DeviceType::NvrV1 => 200,
            DeviceType::NvrV4 => 201,
        }
    }

    pub fn is_recorder(self) -> bool {
        matches!(self, DeviceType::NvrV1 | DeviceType::NvrV4)
    }
}

impl TryFrom<u16> for DeviceType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            100 => Ok(DeviceType::Ipc),
            101 => Ok(DeviceType::WifiIpc),
            200 => Ok(DeviceType::NvrV1),
            201 => Ok(DeviceType::NvrV4),
            other => Err(Error::invalid_argument(format!("device type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OnlineStatus {
    #[default]
    Offline,
    HeartbeatLost,
    Active,
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnlineStatus::Offline => write!(f, "offline"),
            OnlineStatus::HeartbeatLost => write!(f, "heartbeat-lost"),
            OnlineStatus::Active => write!(f, "active"),
        }
    }
}

/// Recorder channel state as last reported by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    Online,
    Offline,
    /// No camera attached to the channel
    Unconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub ptz: bool,
    pub dual_stream: bool,
    pub recording: bool,
}

/// Everything needed to reach a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub address: DeviceAddress,
    pub device_type: DeviceType,
    pub capabilities: Capabilities,
    /// Channels of a recorder, 1 for cameras
    pub channel_count: u16,
    /// Another client holds the device
    pub locked: bool,
}

impl DeviceRecord {
    pub fn camera(address: DeviceAddress) -> Self {
        Self {
            address,
            device_type: DeviceType::Ipc,
            capabilities: Capabilities {
                ptz: false,
                dual_stream: true,
                recording: false,
            },
            channel_count: 1,
            locked: false,
        }
    }

    pub fn recorder(address: DeviceAddress, channel_count: u16) -> Self {
        Self {
            address,
            device_type: DeviceType::NvrV4,
            capabilities: Capabilities {
                ptz: true,
                dual_stream: true,
                recording: true,
            },
            channel_count,
            locked: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.address.device_id
    }
}

/// Source of device records
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Fails with `NotFound`, `DevLocked` or `AuthFailed`
    async fn resolve(&self, device_id: &str) -> Result<DeviceRecord>;
}

/// A directory backed by a map, filled by the application
#[derive(Debug, Default)]
pub struct StaticDirectory {
    records: DashMap<String, DeviceRecord>,
    rejected: DashMap<String, ()>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.rejected.remove(record.device_id());
        self.records.insert(record.device_id().to_string(), record);
    }

    pub fn with(self, record: DeviceRecord) -> Self {
        self.insert(record);
        self
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        self.records.remove(device_id).map(|(_, record)| record)
    }

    /// Make future resolves of `device_id` fail with `AuthFailed`
    pub fn reject_credentials(&self, device_id: &str) {
        self.rejected.insert(device_id.to_string(), ());
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn resolve(&self, device_id: &str) -> Result<DeviceRecord> {
        if self.rejected.contains_key(device_id) {
            return Err(SessionFault::AuthFailed.into());
        }
        let record = self
            .records
            .get(device_id)
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found(device_id))?;
        if record.locked {
            return Err(SessionFault::DevLocked.into());
        }
        Ok(record)
    }
}

/// Snapshot of a device as the registry sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    pub capabilities: Capabilities,
    pub channel_count: u16,
    pub status: OnlineStatus,
    pub channels: BTreeMap<u16, ChannelStatus>,
    pub auto_receive_alarm: bool,
    pub communication_stopped: bool,
    /// Set while an endpoint is open
    pub transport: Option<TransportKind>,
}

impl DeviceInfo {
    pub(crate) fn new(record: &DeviceRecord, auto_receive_alarm: bool) -> Self {
        Self {
            device_id: record.device_id().to_string(),
            device_type: record.device_type,
            capabilities: record.capabilities,
            channel_count: record.channel_count,
            status: OnlineStatus::Offline,
            channels: BTreeMap::new(),
            auto_receive_alarm,
            communication_stopped: false,
            transport: None,
        }
    }

    pub fn channel_status(&self, channel: u16) -> Option<ChannelStatus> {
        self.channels.get(&channel).copied()
    }

    /// Refuse work on a channel the recorder reported as unusable
    pub(crate) fn check_channel(&self, channel: Option<u16>) -> Result<()> {
        let Some(channel) = channel else {
            return Ok(());
        };
        if self.device_type.is_recorder() && channel >= self.channel_count {
            return Err(Error::invalid_argument(format!(
                "channel {} of a {}-channel recorder",
                channel, self.channel_count
            )));
        }
        match self.channel_status(channel) {
            Some(ChannelStatus::Offline) => Err(SessionFault::ChannelOffline(channel).into()),
            Some(ChannelStatus::Unconnected) => Err(SessionFault::ChannelUnconnected(channel).into()),
            _ => Ok(()),
        }
    }
}

/// Families a recorder forwards unchanged to the camera on a channel
fn is_passthrough(family: MessageFamily) -> bool {
    matches!(
        family,
        MessageFamily::ConfigGet
            | MessageFamily::ConfigSet
            | MessageFamily::HwConfig
            | MessageFamily::IotCamera
    )
}

/// How a command for `channel` travels to a device of `device_type`
pub fn route_for(device_type: DeviceType, family: MessageFamily, channel: Option<u16>) -> Route {
    match channel {
        Some(channel) if device_type.is_recorder() && is_passthrough(family) => {
            Route::Transparent(channel)
        }
        _ => Route::Direct,
    }
}
