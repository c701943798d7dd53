use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Link, TransportKind};
use crate::error::Error;
use crate::frame::{FRAME_HEADER_SIZE, FrameHeader};
use crate::Result;

/// TCP connection to the relay broker.
///
/// The stream is a sequence of frames; each read returns exactly one frame
/// using the length field of its header.
#[derive(Debug)]
pub struct TcpRelayLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    server_instance: u32,
}

impl TcpRelayLink {
    /// Connect to the relay and send the notification header for `server_instance`
    pub async fn connect(relay: SocketAddr, server_instance: u32, connect_timeout: Duration) -> Result<Self> {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(relay)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Socket(format!("relay connect {}: {}", relay, e))),
            Err(_) => return Err(Error::HandshakeTimeout(connect_timeout)),
        };
        stream.set_nodelay(true)?;

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(&FrameHeader::notification(server_instance).to_bytes())
            .await
            .map_err(|e| Error::RelayLoginFailed(e.to_string()))?;

        info!(%relay, server_instance, "relay link connected");
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer: relay,
            server_instance,
        })
    }
}

#[async_trait]
impl Link for TcpRelayLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn server_instance(&self) -> u32 {
        self.server_instance
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn recv_raw(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let parsed = FrameHeader::parse(&mut &header[..])?;

        let body_len = parsed.data_length as usize;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body_len);
        buf.put_slice(&header);
        buf.resize(FRAME_HEADER_SIZE + body_len, 0);
        reader.read_exact(&mut buf[FRAME_HEADER_SIZE..]).await?;
        Ok(buf.freeze())
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "relay shutdown");
        }
    }
}
