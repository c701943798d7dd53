//! Opening endpoints to devices.
//!
//! [`open`] turns a [`DeviceAddress`] and a [`TransportHint`] into a connected
//! [`Endpoint`]. The path selection itself lives in [`NetworkDialer`] so that
//! an endpoint can redial the same way when it reconnects.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::link::{Link, TcpRelayLink, TransportKind, UdpLink};
use crate::punch::hole_punch;
use crate::Result;

/// Where a device can be reached.
///
/// Supplied by the surrounding application (login and discovery are outside
/// this crate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    pub device_id: String,
    /// Public mapping of the device for hole-punching
    pub p2p_addr: Option<SocketAddr>,
    /// Relay broker address
    pub relay_addr: Option<SocketAddr>,
    /// Session instance the broker assigned for this device
    pub server_instance: u32,
    /// Address on the local network
    pub lan_addr: Option<SocketAddr>,
}

impl DeviceAddress {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            p2p_addr: None,
            relay_addr: None,
            server_instance: 0,
            lan_addr: None,
        }
    }

    pub fn with_p2p(mut self, addr: SocketAddr) -> Self {
        self.p2p_addr = Some(addr);
        self
    }

    pub fn with_relay(mut self, addr: SocketAddr, server_instance: u32) -> Self {
        self.relay_addr = Some(addr);
        self.server_instance = server_instance;
        self
    }

    pub fn with_lan(mut self, addr: SocketAddr) -> Self {
        self.lan_addr = Some(addr);
        self
    }
}

/// Which paths an open may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportHint {
    /// Hole-punch first, relay on failure
    #[default]
    Auto,
    P2pOnly,
    RelayOnly,
    Lan,
}

impl fmt::Display for TransportHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportHint::Auto => write!(f, "auto"),
            TransportHint::P2pOnly => write!(f, "p2p-only"),
            TransportHint::RelayOnly => write!(f, "relay-only"),
            TransportHint::Lan => write!(f, "lan"),
        }
    }
}

/// Produces a connected link; called once on open and again on every reconnect
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    async fn dial(&self) -> Result<Arc<dyn Link>>;
}

/// Dials real sockets following a [`TransportHint`]
#[derive(Debug, Clone)]
pub struct NetworkDialer {
    address: DeviceAddress,
    hint: TransportHint,
    config: TransportConfig,
}

fn usable(addr: Option<SocketAddr>, what: &str, device_id: &str) -> Result<SocketAddr> {
    match addr {
        Some(addr) if !addr.ip().is_unspecified() && addr.port() != 0 => Ok(addr),
        Some(addr) => Err(Error::AddressInvalid(format!(
            "{} address {} for device {} is not routable",
            what, addr, device_id
        ))),
        None => Err(Error::AddressInvalid(format!(
            "device {} has no {} address",
            device_id, what
        ))),
    }
}

impl NetworkDialer {
    /// Check that the address carries what the hint needs
    pub fn new(address: DeviceAddress, hint: TransportHint, config: TransportConfig) -> Result<Self> {
        if address.device_id.is_empty() {
            return Err(Error::AddressInvalid("empty device id".into()));
        }
        let id = address.device_id.as_str();
        match hint {
            TransportHint::Lan => {
                usable(address.lan_addr, "LAN", id)?;
            }
            TransportHint::P2pOnly => {
                usable(address.p2p_addr, "P2P", id)?;
            }
            TransportHint::RelayOnly => {
                usable(address.relay_addr, "relay", id)?;
            }
            TransportHint::Auto => {
                if address.p2p_addr.is_none() && address.relay_addr.is_none() {
                    return Err(Error::AddressInvalid(format!(
                        "device {} has neither a P2P nor a relay address",
                        id
                    )));
                }
            }
        }
        Ok(Self {
            address,
            hint,
            config,
        })
    }

    async fn dial_p2p(&self) -> Result<Arc<dyn Link>> {
        let peer = usable(self.address.p2p_addr, "P2P", &self.address.device_id)?;
        let link = UdpLink::connect(peer, TransportKind::P2p).await?;
        hole_punch(&link, &self.address.device_id, &self.config).await?;
        Ok(Arc::new(link))
    }

    async fn dial_relay(&self) -> Result<Arc<dyn Link>> {
        let relay = usable(self.address.relay_addr, "relay", &self.address.device_id)?;
        let link = TcpRelayLink::connect(relay, self.address.server_instance, self.config.connect_timeout()).await?;
        Ok(Arc::new(link))
    }

    async fn dial_lan(&self) -> Result<Arc<dyn Link>> {
        let peer = usable(self.address.lan_addr, "LAN", &self.address.device_id)?;
        Ok(Arc::new(UdpLink::connect(peer, TransportKind::Lan).await?))
    }

    async fn dial_auto(&self) -> Result<Arc<dyn Link>> {
        let device_id = &self.address.device_id;
        if self.address.p2p_addr.is_some() {
            match self.dial_p2p().await {
                Ok(link) => return Ok(link),
                Err(Error::P2PAuthFailed) => return Err(Error::P2PAuthFailed),
                Err(e) => {
                    if !self.config.allow_relay_fallback || self.address.relay_addr.is_none() {
                        warn!(device_id = %device_id, error = %e, "P2P failed and no relay fallback");
                        return Err(Error::P2PDisconnected);
                    }
                    info!(device_id = %device_id, error = %e, "P2P failed, falling back to relay");
                }
            }
        }

        self.dial_relay().await.map_err(|e| {
            warn!(device_id = %device_id, error = %e, "relay unreachable");
            match e {
                Error::RelayLoginFailed(_) => e,
                _ => Error::P2PDisconnected,
            }
        })
    }
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn dial(&self) -> Result<Arc<dyn Link>> {
        debug!(device_id = %self.address.device_id, hint = %self.hint, "dialing device");
        match self.hint {
            TransportHint::Auto => self.dial_auto().await,
            TransportHint::P2pOnly => self.dial_p2p().await,
            TransportHint::RelayOnly => self.dial_relay().await,
            TransportHint::Lan => self.dial_lan().await,
        }
    }
}

/// Open an endpoint to `device` using the paths allowed by `hint`
pub async fn open(device: &DeviceAddress, hint: TransportHint, config: &TransportConfig) -> Result<Endpoint> {
    let dialer = NetworkDialer::new(device.clone(), hint, config.clone())?;
    Endpoint::connect(Arc::new(dialer), config.clone()).await
}
