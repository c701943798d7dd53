//! Sessions and their state machines.
//!
//! A [`Session`] is one stream-bearing activity against a device. Its state
//! only moves along the edges [`SessionState::can_transition_to`] allows;
//! every accepted transition is published on a watch channel so that waits
//! for negotiation or drain completion can be cancelled by closing the
//! session.

mod state;
pub mod types;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use camlink_stream_core::{MediaFrame, Packetizer, StreamType};
use camlink_transport_core::TransportHint;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{Error, Result};

pub use state::SessionState;
pub use types::*;

/// Stream index recorders use for replay media
pub const REPLAY_STREAM_INDEX: u8 = 2;
/// Stream index recorders use for download data
pub const DOWNLOAD_STREAM_INDEX: u8 = 3;

/// Frames kept for a session whose start request is still unanswered
const EARLY_MEDIA_LIMIT: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Registry-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    /// Live preview; stream index 0 main, 1 sub
    Watch,
    /// Two-way audio
    Talk,
    /// Recorder playback
    Replay,
    /// Recorder file download
    Download,
    /// File upload to the device
    Upload,
    /// Configuration exchange
    Config,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionKind::Watch => "watch",
            SessionKind::Talk => "talk",
            SessionKind::Replay => "replay",
            SessionKind::Download => "download",
            SessionKind::Upload => "upload",
            SessionKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// At most one live session exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub device_id: String,
    pub kind: SessionKind,
    pub stream_index: u8,
}

/// What callers hold on to. Two opens of the same key yield equal handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: SessionId,
    pub key: SessionKey,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.key.device_id
    }

    pub fn kind(&self) -> SessionKind {
        self.key.kind
    }

    pub fn stream_index(&self) -> u8 {
        self.key.stream_index
    }
}

/// Per-kind open parameters
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    /// Recorder channel the session addresses
    pub channel: Option<u16>,
    pub replay: Option<ReplayRequest>,
    pub download: Option<DownloadRequest>,
    pub upload: Option<UploadRequest>,
    /// Overrides the registry's choice when this open creates the endpoint
    pub transport_hint: Option<TransportHint>,
}

impl OpenParams {
    pub fn channel(channel: u16) -> Self {
        Self {
            channel: Some(channel),
            ..Default::default()
        }
    }

    pub fn replay(request: ReplayRequest) -> Self {
        Self {
            channel: Some(request.channel),
            replay: Some(request),
            ..Default::default()
        }
    }

    pub fn download(request: DownloadRequest) -> Self {
        Self {
            channel: Some(request.channel),
            download: Some(request),
            ..Default::default()
        }
    }

    pub fn upload(request: UploadRequest) -> Self {
        Self {
            upload: Some(request),
            ..Default::default()
        }
    }

    pub fn with_transport_hint(mut self, hint: TransportHint) -> Self {
        self.transport_hint = Some(hint);
        self
    }
}

/// Outgoing talk audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub payload: Bytes,
    /// Capture time, milliseconds
    pub timestamp: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DownloadCursor {
    pub request: DownloadRequest,
    /// Bytes received and acknowledged so far
    pub offset: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadCursor {
    pub request: UploadRequest,
    pub sent: u64,
}

/// Mutable session data, guarded by [`SessionCell`]
#[derive(Debug)]
pub(crate) struct Session {
    pub handle: SessionHandle,
    pub channel: Option<u16>,
    pub state: SessionState,
    pub created_at: Instant,
    pub watch: Option<WatchResponse>,
    pub talk: Option<TalkResponse>,
    pub replay_request: Option<ReplayRequest>,
    pub replay: Option<ReplayResponse>,
    pub download: Option<DownloadCursor>,
    pub upload: Option<UploadCursor>,
    pub packetizer: Option<Packetizer>,
    pub frames_received: u64,
    pub last_frame_index: Option<u32>,
    pub last_error: Option<Error>,
    /// Media reassembled before the start response was processed
    pub early_media: Vec<MediaFrame>,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub state: SessionState,
    pub channel: Option<u16>,
    pub age: std::time::Duration,
    pub frames_received: u64,
    pub last_frame_index: Option<u32>,
    pub watch: Option<WatchResponse>,
    pub talk: Option<TalkResponse>,
    pub replay: Option<ReplayResponse>,
    pub download: Option<DownloadProgress>,
    pub upload: Option<UploadProgress>,
    pub last_error: Option<Error>,
}

/// A session plus the channel its state changes are published on
#[derive(Debug)]
pub(crate) struct SessionCell {
    inner: Mutex<Session>,
    state_tx: watch::Sender<SessionState>,
    /// Held while handing frames to the sink so early and live media stay ordered
    delivery: Mutex<()>,
}

impl SessionCell {
    pub fn new(handle: SessionHandle, params: &OpenParams) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Requesting);
        let download = params.download.clone().map(|request| DownloadCursor {
            offset: request.offset,
            request,
            total: 0,
        });
        let upload = params.upload.clone().map(|request| UploadCursor { request, sent: 0 });
        let packetizer = (handle.key.kind == SessionKind::Talk)
            .then(|| Packetizer::new(StreamType::Audio, handle.key.stream_index));

        Self {
            inner: Mutex::new(Session {
                handle,
                channel: params.channel,
                state: SessionState::Requesting,
                created_at: Instant::now(),
                watch: None,
                talk: None,
                replay_request: params.replay.clone(),
                replay: None,
                download,
                upload,
                packetizer,
                frames_received: 0,
                last_frame_index: None,
                last_error: None,
                early_media: Vec::new(),
            }),
            state_tx,
            delivery: Mutex::new(()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.lock().handle.id
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.lock().handle.clone()
    }

    pub fn kind(&self) -> SessionKind {
        self.inner.lock().handle.key.kind
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run `f` with the session locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Move to `next` if the edge is legal for this session
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut session = self.inner.lock();
        let current = session.state;
        if !current.can_transition_to(next, session.handle.key.kind) {
            return Err(Error::invalid_state(current, "change state"));
        }
        session.state = next;
        debug!(
            session_id = %session.handle.id,
            device_id = %session.handle.key.device_id,
            kind = %session.handle.key.kind,
            from = %current,
            to = %next,
            "session transition"
        );
        drop(session);
        self.state_tx.send_replace(next);
        Ok(current)
    }

    /// Like [`SessionCell::transition`] but only from one of `from`
    pub fn transition_from(&self, from: &[SessionState], next: SessionState) -> Result<SessionState> {
        let current = self.state();
        if !from.contains(&current) {
            return Err(Error::invalid_state(current, "change state"));
        }
        self.transition(next)
    }

    /// Enter `Error` recording why. No-op for terminal sessions.
    pub fn fail(&self, error: Error) {
        let accepted = self.with(|session| {
            if session.state.is_terminal() {
                return false;
            }
            session.last_error = Some(error);
            true
        });
        if accepted {
            let _ = self.transition(SessionState::Error);
        }
    }

    pub fn info(&self) -> SessionInfo {
        let session = self.inner.lock();
        SessionInfo {
            handle: session.handle.clone(),
            state: session.state,
            channel: session.channel,
            age: session.created_at.elapsed(),
            frames_received: session.frames_received,
            last_frame_index: session.last_frame_index,
            watch: session.watch.clone(),
            talk: session.talk.clone(),
            replay: session.replay.clone(),
            download: session.download.as_ref().map(|d| DownloadProgress {
                received: d.offset,
                total: d.total,
            }),
            upload: session.upload.as_ref().map(|u| UploadProgress {
                sent: u.sent,
                total: u.request.total_size,
            }),
            last_error: session.last_error.clone(),
        }
    }

    /// Keep `frame` while the session is still `Requesting`; otherwise hand
    /// it back for delivery.
    pub fn hold_early(&self, frame: MediaFrame) -> Option<MediaFrame> {
        let mut session = self.inner.lock();
        if session.state != SessionState::Requesting {
            return Some(frame);
        }
        if session.early_media.len() >= EARLY_MEDIA_LIMIT {
            let dropped = session.early_media.remove(0);
            debug!(
                session_id = %session.handle.id,
                frame_index = dropped.frame_index,
                "early media overflow, dropping oldest frame"
            );
        }
        session.early_media.push(frame);
        None
    }

    pub fn has_early_media(&self) -> bool {
        !self.inner.lock().early_media.is_empty()
    }

    pub fn take_early_media(&self) -> Vec<MediaFrame> {
        std::mem::take(&mut self.inner.lock().early_media)
    }

    pub fn delivery_lock(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock()
    }

    /// Stream index whose media belongs to this session, if any
    pub fn media_stream_index(&self) -> Option<u8> {
        let session = self.inner.lock();
        match session.handle.key.kind {
            SessionKind::Watch => Some(session.handle.key.stream_index),
            SessionKind::Replay => Some(REPLAY_STREAM_INDEX),
            SessionKind::Download => Some(DOWNLOAD_STREAM_INDEX),
            _ => None,
        }
    }
}
