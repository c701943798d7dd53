//! Delivery of events and media to the application.
//!
//! The registry pushes [`Event`]s and [`MediaEvent`]s into an [`EventSink`].
//! The sink keeps one bounded queue per device, drained by one dispatcher
//! task per device, so the [`EventHandler`] sees each device's traffic in
//! order while a slow device cannot stall the others.
//!
//! Media is offered with `try_send` and dropped (and counted) when the
//! device's queue is full. Control events wait for room.
//!
//! ```rust
//! use async_trait::async_trait;
//! use camlink_session_core::events::{Event, EventHandler, MediaEvent};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_event(&self, event: Event) {
//!         println!("{:#06x} {:?}", event.code() as u32, event);
//!     }
//!
//!     async fn on_media(&self, media: MediaEvent) {
//!         println!("{} bytes from {}", media.frame.len(), media.device_id);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use camlink_command_core::CommandCode;
use camlink_stream_core::{MediaFrame, StreamType};
use camlink_transport_core::TransportKind;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::commands::{live, replay, system};
use crate::device::{ChannelStatus, OnlineStatus};
use crate::session::{
    AlarmInfo, DownloadProgress, EventInfo, ReplayAction, SessionHandle, SessionState, UploadProgress,
};

/// Numeric event codes.
///
/// Values below `0x2100` match the legacy callback numbering; the rest are
/// events that numbering has no slot for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    RspAddWatch = 0x2004,
    RspPtz = 0x2005,
    RspTalk = 0x2006,
    RspTalkClose = 0x2007,
    Alarm = 0x2008,
    Event = 0x2009,
    P2pConnectOk = 0x200a,
    P2pNetType = 0x200c,
    P2pOffline = 0x200d,
    NvrOffline = 0x200e,
    NvrChOffline = 0x200f,
    NvrChOnline = 0x2010,
    NvrChUnconnected = 0x2011,
    RspUploadFile = 0x2013,
    UploadProgress = 0x2014,
    UploadFailed = 0x2015,
    UploadOk = 0x2016,
    AuthFailed = 0x2017,
    SearchNvrRec = 0x2019,
    NvrReplay = 0x201a,
    P2pTcpTimeout = 0x201c,
    PlayStartNvr = 0x2023,
    PlaySeekNvr = 0x2024,
    SearchByMonth = 0x2025,
    NvrRecordDownloadStart = 0x202b,
    NvrRecordDownloadFailed = 0x202c,
    NvrRecordDownloadProgress = 0x202d,
    /// Any other command response
    Response = 0x2100,
    SessionState = 0x2101,
    DownloadComplete = 0x2102,
}

/// Something the application should hear about
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// An endpoint to the device is up
    Connected { device_id: String, kind: TransportKind },
    DeviceStatus {
        device_id: String,
        status: OnlineStatus,
        /// Recorders report offline with their own code
        recorder: bool,
    },
    ChannelStatus { device_id: String, channel: u16, status: ChannelStatus },
    AuthFailed { device_id: String },
    Alarm { device_id: String, info: AlarmInfo },
    DeviceEvent { device_id: String, info: EventInfo },
    /// Every command response, whoever was waiting for it
    Response {
        device_id: String,
        code: CommandCode,
        result: i32,
        channel: Option<u16>,
        payload: Bytes,
    },
    SessionState {
        handle: SessionHandle,
        from: SessionState,
        to: SessionState,
    },
    UploadProgress { handle: SessionHandle, progress: UploadProgress },
    UploadOk { handle: SessionHandle },
    UploadFailed { handle: SessionHandle, reason: String },
    DownloadProgress { handle: SessionHandle, progress: DownloadProgress },
    DownloadFailed { handle: SessionHandle, reason: String },
    DownloadComplete { handle: SessionHandle, bytes: u64 },
}

fn response_code(code: CommandCode) -> EventCode {
    match code {
        live::START_WATCH => EventCode::RspAddWatch,
        live::START_TALK => EventCode::RspTalk,
        live::STOP_TALK => EventCode::RspTalkClose,
        system::PTZ => EventCode::RspPtz,
        system::UPLOAD_START => EventCode::RspUploadFile,
        replay::PLAY_START => EventCode::PlayStartNvr,
        replay::SEARCH_RECORDS => EventCode::SearchNvrRec,
        replay::SEARCH_BY_MONTH => EventCode::SearchByMonth,
        replay::DOWNLOAD_START => EventCode::NvrRecordDownloadStart,
        c if c == replay::action(ReplayAction::Seek) => EventCode::PlaySeekNvr,
        c if c.family == replay::PLAY_START.family && c.code <= ReplayAction::Normal as u16 => {
            EventCode::NvrReplay
        }
        _ => EventCode::Response,
    }
}

impl Event {
    pub fn code(&self) -> EventCode {
        match self {
            Event::Connected { .. } => EventCode::P2pNetType,
            Event::DeviceStatus { status, recorder, .. } => match status {
                OnlineStatus::Active => EventCode::P2pConnectOk,
                OnlineStatus::HeartbeatLost => EventCode::P2pTcpTimeout,
                OnlineStatus::Offline if *recorder => EventCode::NvrOffline,
                OnlineStatus::Offline => EventCode::P2pOffline,
            },
            Event::ChannelStatus { status, .. } => match status {
                ChannelStatus::Online => EventCode::NvrChOnline,
                ChannelStatus::Offline => EventCode::NvrChOffline,
                ChannelStatus::Unconnected => EventCode::NvrChUnconnected,
            },
            Event::AuthFailed { .. } => EventCode::AuthFailed,
            Event::Alarm { .. } => EventCode::Alarm,
            Event::DeviceEvent { .. } => EventCode::Event,
            Event::Response { code, .. } => response_code(*code),
            Event::SessionState { .. } => EventCode::SessionState,
            Event::UploadProgress { .. } => EventCode::UploadProgress,
            Event::UploadOk { .. } => EventCode::UploadOk,
            Event::UploadFailed { .. } => EventCode::UploadFailed,
            Event::DownloadProgress { .. } => EventCode::NvrRecordDownloadProgress,
            Event::DownloadFailed { .. } => EventCode::NvrRecordDownloadFailed,
            Event::DownloadComplete { .. } => EventCode::DownloadComplete,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Event::Connected { device_id, .. }
            | Event::DeviceStatus { device_id, .. }
            | Event::ChannelStatus { device_id, .. }
            | Event::AuthFailed { device_id }
            | Event::Alarm { device_id, .. }
            | Event::DeviceEvent { device_id, .. }
            | Event::Response { device_id, .. } => device_id,
            Event::SessionState { handle, .. }
            | Event::UploadProgress { handle, .. }
            | Event::UploadOk { handle }
            | Event::UploadFailed { handle, .. }
            | Event::DownloadProgress { handle, .. }
            | Event::DownloadFailed { handle, .. }
            | Event::DownloadComplete { handle, .. } => handle.device_id(),
        }
    }
}

/// Per-frame metadata handed out with media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaExt {
    pub key_frame: bool,
    pub timestamp: u32,
    /// Recorder channel, `None` for cameras
    pub channel: Option<u16>,
}

impl MediaExt {
    /// Channel as the legacy API reports it, -1 when unspecified
    pub fn channel_code(&self) -> i32 {
        self.channel.map(i32::from).unwrap_or(-1)
    }
}

/// A reassembled frame and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub device_id: String,
    pub handle: SessionHandle,
    pub media_type: StreamType,
    pub frame: MediaFrame,
    pub ext: MediaExt,
}

/// Application callbacks
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Event);

    async fn on_media(&self, _media: MediaEvent) {}
}

enum Delivery {
    Event(Event),
    Media(MediaEvent),
}

struct DeviceQueue {
    tx: mpsc::Sender<Delivery>,
    task: JoinHandle<()>,
}

type SharedHandler = Arc<RwLock<Option<Arc<dyn EventHandler>>>>;

/// Per-device ordered delivery to one [`EventHandler`]
pub struct EventSink {
    handler: SharedHandler,
    queues: DashMap<String, DeviceQueue>,
    capacity: usize,
    dropped_media: AtomicU64,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("devices", &self.queues.len())
            .field("capacity", &self.capacity)
            .field("dropped_media", &self.dropped_media())
            .finish()
    }
}

impl EventSink {
    pub fn new(handler: Option<Arc<dyn EventHandler>>, capacity: usize) -> Self {
        Self {
            handler: Arc::new(RwLock::new(handler)),
            queues: DashMap::new(),
            capacity: capacity.max(1),
            dropped_media: AtomicU64::new(0),
        }
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Media frames discarded because a device queue was full
    pub fn dropped_media(&self) -> u64 {
        self.dropped_media.load(Ordering::Relaxed)
    }

    fn sender(&self, device_id: &str) -> mpsc::Sender<Delivery> {
        if let Some(queue) = self.queues.get(device_id) {
            return queue.tx.clone();
        }
        self.queues
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                let task = tokio::spawn(dispatch(device_id.to_string(), rx, self.handler.clone()));
                DeviceQueue { tx, task }
            })
            .tx
            .clone()
    }

    /// Queue a control event, waiting for room
    pub async fn emit(&self, event: Event) {
        if !self.has_handler() {
            return;
        }
        let tx = self.sender(event.device_id());
        if tx.send(Delivery::Event(event)).await.is_err() {
            trace!("event queue closed");
        }
    }

    /// Offer a media frame; returns false if it was dropped
    pub fn emit_media(&self, media: MediaEvent) -> bool {
        if !self.has_handler() {
            return false;
        }
        let tx = self.sender(&media.device_id);
        match tx.try_send(Delivery::Media(media)) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped_media.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped, "media queue full, frame dropped");
                false
            }
        }
    }

    /// Stop delivering for one device once its queue drains
    pub fn remove_device(&self, device_id: &str) {
        self.queues.remove(device_id);
    }

    /// Unregister the handler and stop all dispatchers
    pub fn shutdown(&self) {
        self.set_handler(None);
        for entry in self.queues.iter() {
            entry.task.abort();
        }
        self.queues.clear();
    }
}

async fn dispatch(device_id: String, mut rx: mpsc::Receiver<Delivery>, handler: SharedHandler) {
    debug!(device_id = %device_id, "event dispatcher started");
    while let Some(delivery) = rx.recv().await {
        let Some(handler) = handler.read().clone() else {
            continue;
        };
        match delivery {
            Delivery::Event(event) => handler.on_event(event).await,
            Delivery::Media(media) => handler.on_media(media).await,
        }
    }
    debug!(device_id = %device_id, "event dispatcher stopped");
}
