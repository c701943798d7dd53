//! Byte-level links underneath an endpoint.
//!
//! A [`Link`] moves whole frames (header plus body) and knows nothing about
//! their content. The [`crate::Endpoint`] owns framing, send serialization and
//! the inbound reader on top of it.

mod tcp;
mod udp;

pub use tcp::TcpRelayLink;
pub use udp::UdpLink;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// The physical path a link uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Hole-punched UDP straight to the device
    P2p,
    /// TCP through the relay broker
    Relay,
    /// UDP on the local network, no traversal
    Lan,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::P2p => write!(f, "p2p"),
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Lan => write!(f, "lan"),
        }
    }
}

#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Session instance assigned by a relay broker, zero elsewhere
    fn server_instance(&self) -> u32 {
        0
    }

    /// Write one encoded frame
    async fn send_raw(&self, data: &[u8]) -> Result<()>;

    /// Read the next encoded frame. Only one reader may call this at a time.
    async fn recv_raw(&self) -> Result<Bytes>;

    async fn shutdown(&self);
}
