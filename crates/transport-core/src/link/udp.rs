use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Link, TransportKind};
use crate::error::Error;
use crate::Result;

/// Receive buffer size; one datagram carries at most one frame
const RECV_BUFFER_SIZE: usize = 65_536;

/// A UDP socket connected to one device address
#[derive(Debug, Clone)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    kind: TransportKind,
}

impl UdpLink {
    /// Bind an ephemeral local port of the peer's address family and connect it
    pub async fn connect(peer: SocketAddr, kind: TransportKind) -> Result<Self> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        debug!(%peer, local = ?socket.local_addr().ok(), %kind, "UDP link connected");
        Ok(Self {
            socket: Arc::new(socket),
            peer,
            kind,
        })
    }

    /// Wrap a socket that is already connected to `peer`
    pub fn from_socket(socket: Arc<UdpSocket>, peer: SocketAddr, kind: TransportKind) -> Self {
        Self { socket, peer, kind }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

#[async_trait]
impl Link for UdpLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let sent = self.socket.send(data).await?;
        if sent != data.len() {
            return Err(Error::Socket(format!(
                "short datagram write: {} of {} bytes",
                sent,
                data.len()
            )));
        }
        trace!(peer = %self.peer, bytes = sent, "datagram sent");
        Ok(())
    }

    async fn recv_raw(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    async fn shutdown(&self) {
        // Dropping the last Arc closes the socket; nothing to flush for UDP.
        debug!(peer = %self.peer, "UDP link shut down");
    }
}
