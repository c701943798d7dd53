//! In-process links.
//!
//! [`MemoryLink::pair`] returns two connected ends. The client end goes into an
//! [`crate::Endpoint`]; the other end plays the device, which lets the session
//! layer run against a scripted device without sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::connector::Dialer;
use crate::error::Error;
use crate::frame::Frame;
use crate::link::{Link, TransportKind};
use crate::Result;

const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// One end of an in-process link
#[derive(Debug)]
pub struct MemoryLink {
    kind: TransportKind,
    server_instance: u32,
    tx: SyncMutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryLink {
    /// Two connected ends; whatever one sends the other receives
    pub fn pair(kind: TransportKind) -> (MemoryLink, MemoryLink) {
        let (a_tx, a_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(MEMORY_CHANNEL_CAPACITY);
        (
            MemoryLink {
                kind,
                server_instance: 0,
                tx: SyncMutex::new(Some(a_tx)),
                rx: Mutex::new(b_rx),
            },
            MemoryLink {
                kind,
                server_instance: 0,
                tx: SyncMutex::new(Some(b_tx)),
                rx: Mutex::new(a_rx),
            },
        )
    }

    pub fn with_server_instance(mut self, server_instance: u32) -> Self {
        self.server_instance = server_instance;
        self
    }

    /// Encode and send a frame, for the device side of a test
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send_raw(&frame.encode()?).await
    }

    /// Receive and decode the next frame
    pub async fn recv_frame(&self) -> Result<Frame> {
        Frame::decode(self.recv_raw().await?)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn server_instance(&self) -> u32 {
        self.server_instance
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(Error::EndpointClosed)?;
        tx.send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| Error::Socket("memory peer hung up".into()))?;
        trace!(bytes = data.len(), "memory link send");
        Ok(())
    }

    async fn recv_raw(&self) -> Result<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::Socket("memory peer hung up".into()))
    }

    async fn shutdown(&self) {
        self.tx.lock().take();
    }
}

type LinkSource = dyn Fn() -> Result<Arc<dyn Link>> + Send + Sync;

/// A [`Dialer`] that hands out in-process links and counts dials
pub struct MemoryDialer {
    source: Box<LinkSource>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    /// `source` runs once per dial and returns the client end of a fresh link
    pub fn new<F>(source: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Link>> + Send + Sync + 'static,
    {
        Self {
            source: Box::new(source),
            dials: AtomicUsize::new(0),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDialer")
            .field("dials", &self.dial_count())
            .finish()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Arc<dyn Link>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        (self.source)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PacketType;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (client, device) = MemoryLink::pair(TransportKind::Lan);
        client
            .send_frame(&Frame::new(PacketType::Control, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        let got = device.recv_frame().await.unwrap();
        assert_eq!(got.body, Bytes::from_static(b"ping"));

        device
            .send_frame(&Frame::from_device(PacketType::Control, Bytes::from_static(b"pong")))
            .await
            .unwrap();
        assert_eq!(client.recv_frame().await.unwrap().body, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_shutdown_ends_peer_reads() {
        let (client, device) = MemoryLink::pair(TransportKind::Lan);
        client.shutdown().await;
        assert!(matches!(device.recv_raw().await, Err(Error::Socket(_))));
        assert_eq!(client.send_raw(b"x").await, Err(Error::EndpointClosed));
    }
}
