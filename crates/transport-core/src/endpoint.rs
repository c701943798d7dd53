//! The per-device transport endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connector::Dialer;
use crate::error::Error;
use crate::frame::{DataSource, Frame, PacketType};
use crate::link::{Link, TransportKind};
use crate::Result;

const STATUS_CHANNEL_CAPACITY: usize = 32;

static NEXT_ENDPOINT_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique endpoint identifier, used as the transport channel of a
/// command correlation key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

impl EndpointId {
    fn next() -> Self {
        EndpointId(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Connection status changes published by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointStatus {
    Connected { kind: TransportKind },
    Reconnected { kind: TransportKind, generation: u64 },
    /// Nothing received for longer than the heartbeat timeout
    HeartbeatLost,
    /// The link failed; the endpoint stays open and may be reconnected
    ConnectionLost { reason: String },
    Closed,
}

/// Counters for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub reconnects: u64,
}

/// State shared with the reader and heartbeat tasks
#[derive(Debug)]
struct Shared {
    last_rx: SyncMutex<Instant>,
    heartbeat_lost: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
}

impl Shared {
    fn touch(&self) {
        *self.last_rx.lock() = Instant::now();
        self.heartbeat_lost.store(false, Ordering::Relaxed);
    }
}

/// Inbound frames of an endpoint.
///
/// Reading from the link starts when the stream is taken. The stream survives
/// [`Endpoint::reconnect`] and ends only when the endpoint is closed.
#[derive(Debug)]
pub struct InboundStream {
    rx: mpsc::Receiver<Frame>,
}

impl InboundStream {
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Stream for InboundStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

struct EndpointInner {
    id: EndpointId,
    dialer: Arc<dyn Dialer>,
    config: TransportConfig,
    link: RwLock<Arc<dyn Link>>,
    send_lock: Mutex<()>,
    closed: watch::Sender<bool>,
    inbound_tx: SyncMutex<Option<mpsc::Sender<Frame>>>,
    inbound_rx: SyncMutex<Option<mpsc::Receiver<Frame>>>,
    reader_started: AtomicBool,
    reader: SyncMutex<Option<JoinHandle<()>>>,
    heartbeat: SyncMutex<Option<JoinHandle<()>>>,
    status_tx: broadcast::Sender<EndpointStatus>,
    generation: AtomicU64,
    shared: Arc<Shared>,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

/// One physical connection to one device.
///
/// Cloning is cheap and every clone refers to the same connection. Sends from
/// any number of tasks are serialized so frames never interleave on the wire.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Dial through `dialer` and wrap the resulting link
    pub async fn connect(dialer: Arc<dyn Dialer>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let link = dialer.dial().await?;
        let kind = link.kind();

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (closed, _) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let endpoint = Endpoint {
            inner: Arc::new(EndpointInner {
                id: EndpointId::next(),
                dialer,
                config,
                link: RwLock::new(link),
                send_lock: Mutex::new(()),
                closed,
                inbound_tx: SyncMutex::new(Some(inbound_tx)),
                inbound_rx: SyncMutex::new(Some(inbound_rx)),
                reader_started: AtomicBool::new(false),
                reader: SyncMutex::new(None),
                heartbeat: SyncMutex::new(None),
                status_tx,
                generation: AtomicU64::new(0),
                shared: Arc::new(Shared {
                    last_rx: SyncMutex::new(Instant::now()),
                    heartbeat_lost: AtomicBool::new(false),
                    frames_sent: AtomicU64::new(0),
                    frames_received: AtomicU64::new(0),
                    malformed_frames: AtomicU64::new(0),
                }),
            }),
        };

        info!(endpoint_id = %endpoint.id(), %kind, "endpoint connected");
        let _ = endpoint.inner.status_tx.send(EndpointStatus::Connected { kind });
        endpoint.spawn_heartbeat();
        Ok(endpoint)
    }

    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.link.read().kind()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.link.read().peer_addr()
    }

    pub fn server_instance(&self) -> u32 {
        self.inner.link.read().server_instance()
    }

    /// Number of successful reconnects
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EndpointStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn stats(&self) -> EndpointStats {
        let shared = &self.inner.shared;
        EndpointStats {
            frames_sent: shared.frames_sent.load(Ordering::Relaxed),
            frames_received: shared.frames_received.load(Ordering::Relaxed),
            malformed_frames: shared.malformed_frames.load(Ordering::Relaxed),
            reconnects: self.generation(),
        }
    }

    /// Take the inbound frame stream and start reading the link
    pub fn inbound(&self) -> Result<InboundStream> {
        let rx = self.inner.inbound_rx.lock().take().ok_or(Error::InboundTaken)?;
        self.inner.reader_started.store(true, Ordering::SeqCst);
        self.spawn_reader();
        Ok(InboundStream { rx })
    }

    /// Send one frame. Fails with [`Error::EndpointClosed`] once the endpoint
    /// is closed, including when the close happens while the send is queued.
    pub async fn send(&self, mut frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }
        let mut closed_rx = self.inner.closed.subscribe();

        let _guard = tokio::select! {
            guard = self.inner.send_lock.lock() => guard,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::EndpointClosed),
        };

        let link = self.inner.link.read().clone();
        frame.header.server_instance = link.server_instance();
        frame.header.data_source = DataSource::Client;
        let bytes = frame.encode()?;

        tokio::select! {
            sent = link.send_raw(&bytes) => sent?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::EndpointClosed),
        }

        self.inner.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(endpoint_id = %self.id(), packet_type = %frame.packet_type(), bytes = bytes.len(), "frame sent");
        Ok(())
    }

    /// Convenience wrapper around [`Endpoint::send`]
    pub async fn send_body(&self, packet_type: PacketType, body: Bytes) -> Result<()> {
        self.send(Frame::new(packet_type, body)).await
    }

    /// Dial again and swap in the new link. The inbound stream keeps flowing.
    pub async fn reconnect(&self) -> Result<()> {
        self.reconnect_from(self.generation()).await.map(|_| ())
    }

    /// Reconnect unless the link of `generation` was already replaced.
    /// Returns whether this call dialed.
    pub async fn reconnect_from(&self, generation: u64) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::EndpointClosed);
        }
        let mut closed_rx = self.inner.closed.subscribe();
        let _guard = self.inner.send_lock.lock().await;
        if self.generation() != generation {
            debug!(endpoint_id = %self.id(), generation, "link already replaced");
            return Ok(false);
        }

        let link = tokio::select! {
            dialed = self.inner.dialer.dial() => dialed?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::EndpointClosed),
        };
        let kind = link.kind();

        let old = {
            let mut current = self.inner.link.write();
            std::mem::replace(&mut *current, link)
        };
        old.shutdown().await;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.shared.touch();
        if self.inner.reader_started.load(Ordering::SeqCst) {
            self.spawn_reader();
        }

        info!(endpoint_id = %self.id(), %kind, generation, "endpoint reconnected");
        let _ = self.inner.status_tx.send(EndpointStatus::Reconnected { kind, generation });
        Ok(true)
    }

    /// Release the link and cancel queued sends. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.send_replace(true) {
            return Ok(());
        }

        if let Some(handle) = self.inner.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }
        self.inner.inbound_tx.lock().take();
        self.inner.inbound_rx.lock().take();

        let link = self.inner.link.read().clone();
        link.shutdown().await;

        info!(endpoint_id = %self.id(), "endpoint closed");
        let _ = self.inner.status_tx.send(EndpointStatus::Closed);
        Ok(())
    }

    fn spawn_reader(&self) {
        let Some(tx) = self.inner.inbound_tx.lock().clone() else {
            return;
        };
        let link = self.inner.link.read().clone();
        let shared = self.inner.shared.clone();
        let status_tx = self.inner.status_tx.clone();
        let mut closed_rx = self.inner.closed.subscribe();
        let endpoint_id = self.id();

        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    received = link.recv_raw() => received,
                    _ = closed_rx.wait_for(|closed| *closed) => break,
                };

                match received {
                    Ok(raw) => match Frame::decode(raw) {
                        Ok(frame) => {
                            shared.touch();
                            shared.frames_received.fetch_add(1, Ordering::Relaxed);
                            if frame.packet_type() == PacketType::Heartbeat {
                                continue;
                            }
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            debug!(%endpoint_id, error = %e, "dropping malformed frame");
                        }
                    },
                    Err(e) => {
                        if *closed_rx.borrow() {
                            break;
                        }
                        warn!(%endpoint_id, error = %e, "link receive failed");
                        let _ = status_tx.send(EndpointStatus::ConnectionLost {
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
            debug!(%endpoint_id, "inbound reader stopped");
        });

        if let Some(previous) = self.inner.reader.lock().replace(handle) {
            previous.abort();
        }
    }

    fn spawn_heartbeat(&self) {
        let Some(interval) = self.inner.config.heartbeat_interval() else {
            return;
        };
        let timeout = self.inner.config.heartbeat_timeout();
        let weak: Weak<EndpointInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let endpoint = Endpoint { inner };
                if endpoint.is_closed() {
                    break;
                }
                if let Err(e) = endpoint.send_body(PacketType::Heartbeat, Bytes::new()).await {
                    debug!(endpoint_id = %endpoint.id(), error = %e, "heartbeat send failed");
                }

                let shared = &endpoint.inner.shared;
                let silent_for = shared.last_rx.lock().elapsed();
                if silent_for >= timeout && !shared.heartbeat_lost.swap(true, Ordering::Relaxed) {
                    warn!(endpoint_id = %endpoint.id(), silent_ms = silent_for.as_millis() as u64, "heartbeat lost");
                    let _ = endpoint.inner.status_tx.send(EndpointStatus::HeartbeatLost);
                }
            }
        });
        *self.inner.heartbeat.lock() = Some(handle);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .field("generation", &self.generation())
            .finish()
    }
}
