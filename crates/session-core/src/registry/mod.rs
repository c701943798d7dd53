//! The session registry.
//!
//! [`SessionRegistry`] is the entry point of the session layer. It resolves
//! devices through a [`DeviceDirectory`], opens at most one [`Endpoint`] per
//! device, enforces one live session per [`SessionKey`] and drives each
//! session's state machine from command responses, media and endpoint status.
//!
//! Opening, closing and endpoint teardown for a device run under that
//! device's async mutex; different devices never contend.
//!
//! ```no_run
//! use std::sync::Arc;
//! use camlink_session_core::prelude::*;
//! use camlink_transport_core::DeviceAddress;
//!
//! # async fn example() -> Result<()> {
//! let directory = Arc::new(StaticDirectory::new().with(DeviceRecord::camera(
//!     DeviceAddress::new("D1").with_p2p("203.0.113.7:32100".parse().unwrap()),
//! )));
//! let registry = SessionRegistry::with_network(CamlinkConfig::default(), directory, None)?;
//! let handle = registry
//!     .open("D1", SessionKind::Watch, 0, OpenParams::default())
//!     .await?;
//! registry.close(&handle).await?;
//! # Ok(())
//! # }
//! ```

mod control;
mod dispatch;
mod factory;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use camlink_command_core::{
    CommandCode, CommandCorrelator, CommandEnvelope, OwnerId, PendingCommand, RequestOptions, Route,
};
use camlink_stream_core::{PacketReassembler, ReassemblyStats, StreamType};
use camlink_transport_core::{Endpoint, EndpointId, EndpointStats, TransportHint, TransportKind};
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{live, replay, system};
use crate::config::CamlinkConfig;
use crate::device::{DeviceDirectory, DeviceInfo, DeviceRecord, OnlineStatus, route_for};
use crate::errors::{Error, Result, SessionFault, TransportFault};
use crate::events::{Event, EventHandler, EventSink};
use crate::session::{
    DOWNLOAD_STREAM_INDEX, OpenParams, REPLAY_STREAM_INDEX, ReplayAction, ReplayControl, ReplayResponse,
    SessionCell, SessionHandle, SessionId, SessionInfo, SessionKey, SessionKind, SessionState,
    StreamSelect, TalkResponse, WatchRequest, WatchResponse,
};

pub use factory::{EndpointFactory, NetworkEndpointFactory};

/// The open connection of a device and the tasks reading it
struct Connection {
    endpoint: Endpoint,
    tasks: Vec<JoinHandle<()>>,
    /// Generation of the link that was reported lost, until it is replaced
    lost_at: Option<u64>,
}

struct DeviceState {
    record: Option<DeviceRecord>,
    info: Option<DeviceInfo>,
    auto_receive_alarm: bool,
    connection: Option<Connection>,
    sessions: HashMap<SessionKey, Arc<SessionCell>>,
    reassembler: PacketReassembler,
}

/// Everything the registry keeps for one device
pub(crate) struct DeviceSlot {
    device_id: String,
    /// Serializes open, close and teardown for this device
    lock: Mutex<()>,
    state: SyncMutex<DeviceState>,
}

impl DeviceSlot {
    fn new(device_id: &str, config: &CamlinkConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            lock: Mutex::new(()),
            state: SyncMutex::new(DeviceState {
                record: None,
                info: None,
                auto_receive_alarm: config.session.auto_receive_alarm,
                connection: None,
                sessions: HashMap::new(),
                reassembler: PacketReassembler::new(config.reassembly.clone()),
            }),
        }
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn endpoint(&self) -> Option<Endpoint> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|c| c.endpoint.clone())
    }

    fn live_session(&self, key: &SessionKey) -> Option<Arc<SessionCell>> {
        self.state
            .lock()
            .sessions
            .get(key)
            .filter(|cell| {
                let state = cell.state();
                !state.is_terminal() && state != SessionState::Draining
            })
            .cloned()
    }

    fn draining_session(&self, key: &SessionKey) -> Option<Arc<SessionCell>> {
        self.state
            .lock()
            .sessions
            .get(key)
            .filter(|cell| cell.state() == SessionState::Draining)
            .cloned()
    }

    fn has_live_sessions(&self) -> bool {
        self.state
            .lock()
            .sessions
            .values()
            .any(|cell| !cell.state().is_terminal())
    }

    /// Remember that the current link died
    pub(crate) fn mark_lost(&self) {
        if let Some(connection) = self.state.lock().connection.as_mut() {
            connection.lost_at.get_or_insert(connection.endpoint.generation());
        }
    }

    /// Forget a loss once a link newer than the lost one is in place
    pub(crate) fn mark_replaced(&self, generation: u64) {
        if let Some(connection) = self.state.lock().connection.as_mut() {
            if connection.lost_at.is_some_and(|lost| lost < generation) {
                connection.lost_at = None;
            }
        }
    }

    pub(crate) fn session_by_id(&self, id: SessionId) -> Option<Arc<SessionCell>> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|cell| cell.id() == id)
            .cloned()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<SessionCell>> {
        self.state.lock().sessions.values().cloned().collect()
    }

    /// The live session media on `stream_index` belongs to
    pub(crate) fn session_for_stream(&self, stream_index: u8) -> Option<Arc<SessionCell>> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|cell| cell.media_stream_index() == Some(stream_index) && !cell.state().is_terminal())
            .cloned()
    }

    pub(crate) fn sessions_of_kind(&self, kind: SessionKind) -> Vec<Arc<SessionCell>> {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|cell| cell.kind() == kind)
            .cloned()
            .collect()
    }

    fn remove_session(&self, cell: &SessionCell) {
        let id = cell.id();
        self.state.lock().sessions.retain(|_, c| c.id() != id);
    }

    pub(crate) fn info(&self) -> Option<DeviceInfo> {
        self.state.lock().info.clone()
    }

    pub(crate) fn update_info<R>(&self, f: impl FnOnce(&mut DeviceInfo) -> R) -> Option<R> {
        self.state.lock().info.as_mut().map(f)
    }

    pub(crate) fn auto_receive_alarm(&self) -> bool {
        self.state.lock().auto_receive_alarm
    }

    fn set_auto_receive_alarm(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_receive_alarm = enabled;
        if let Some(info) = state.info.as_mut() {
            info.auto_receive_alarm = enabled;
        }
    }

    pub(crate) fn with_reassembler<R>(&self, f: impl FnOnce(&mut PacketReassembler) -> R) -> R {
        f(&mut self.state.lock().reassembler)
    }

    fn reset_media_stream(&self, stream_index: u8) {
        self.with_reassembler(|r| {
            r.reset_stream(StreamType::Video, stream_index);
            r.reset_stream(StreamType::Audio, stream_index);
        });
    }
}

/// Transport details of an open endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub endpoint_id: EndpointId,
    pub kind: TransportKind,
    pub peer_addr: Option<SocketAddr>,
    pub server_instance: u32,
    pub generation: u64,
    pub stats: EndpointStats,
}

/// Result of [`SessionRegistry::lookup`]
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceView {
    /// `None` until the device has been resolved once
    pub info: Option<DeviceInfo>,
    pub transport: Option<TransportInfo>,
    pub sessions: Vec<SessionInfo>,
    pub reassembly: ReassemblyStats,
}

/// Decode a JSON body, treating an empty payload as the default value
pub(crate) fn decode_body<T: DeserializeOwned + Default>(envelope: &CommandEnvelope) -> Result<T> {
    if envelope.payload.is_empty() {
        return Ok(T::default());
    }
    Ok(envelope.json()?)
}

fn owner_of(cell: &SessionCell) -> Option<OwnerId> {
    Some(cell.id().0)
}

pub(crate) struct RegistryInner {
    config: RwLock<CamlinkConfig>,
    directory: Arc<dyn DeviceDirectory>,
    factory: Arc<dyn EndpointFactory>,
    correlator: CommandCorrelator,
    sink: EventSink,
    devices: DashMap<String, Arc<DeviceSlot>>,
    shut_down: AtomicBool,
}

impl RegistryInner {
    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SessionFault::CommunicationStopped.into());
        }
        Ok(())
    }

    pub(crate) fn config(&self) -> CamlinkConfig {
        self.config.read().clone()
    }

    pub(crate) fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub(crate) fn correlator(&self) -> &CommandCorrelator {
        &self.correlator
    }

    fn slot(&self, device_id: &str) -> Arc<DeviceSlot> {
        if let Some(slot) = self.devices.get(device_id) {
            return slot.clone();
        }
        let config = self.config();
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceSlot::new(device_id, &config)))
            .clone()
    }

    fn existing_slot(&self, device_id: &str) -> Result<Arc<DeviceSlot>> {
        self.devices
            .get(device_id)
            .map(|slot| slot.clone())
            .ok_or_else(|| Error::not_found(device_id))
    }

    fn session_cell(&self, handle: &SessionHandle) -> Result<(Arc<DeviceSlot>, Arc<SessionCell>)> {
        let slot = self.existing_slot(handle.device_id())?;
        let cell = slot
            .session_by_id(handle.id)
            .ok_or_else(|| Error::not_found(format!("session {}", handle.id)))?;
        Ok((slot, cell))
    }

    /// Fetch the device record once and keep it
    async fn resolve_device(&self, slot: &DeviceSlot) -> Result<DeviceRecord> {
        if let Some(record) = slot.state.lock().record.clone() {
            return Ok(record);
        }
        let record = match self.directory.resolve(slot.device_id()).await {
            Ok(record) => record,
            Err(e) => {
                warn!(device_id = %slot.device_id(), error = %e, "device resolution failed");
                if e == Error::Session(SessionFault::AuthFailed) {
                    self.sink
                        .emit(Event::AuthFailed {
                            device_id: slot.device_id().to_string(),
                        })
                        .await;
                }
                return Err(e);
            }
        };
        let mut state = slot.state.lock();
        let info = DeviceInfo::new(&record, state.auto_receive_alarm);
        state.info = Some(info);
        state.record = Some(record.clone());
        Ok(record)
    }

    fn check_usable(&self, slot: &DeviceSlot, channel: Option<u16>) -> Result<()> {
        let Some(info) = slot.info() else {
            return Ok(());
        };
        if info.communication_stopped {
            return Err(SessionFault::CommunicationStopped.into());
        }
        info.check_channel(channel)
    }

    /// Return the device's endpoint, connecting if there is none.
    /// Caller holds the device lock.
    async fn ensure_connection(
        self: &Arc<Self>,
        slot: &Arc<DeviceSlot>,
        record: &DeviceRecord,
        hint: TransportHint,
    ) -> Result<Endpoint> {
        let current = slot
            .state
            .lock()
            .connection
            .as_ref()
            .map(|c| (c.endpoint.clone(), c.lost_at));
        match current {
            None => {}
            Some((endpoint, _)) if endpoint.is_closed() => {
                self.teardown(slot, "endpoint closed underneath").await;
            }
            Some((endpoint, None)) => return Ok(endpoint),
            Some((endpoint, Some(generation))) if slot.has_live_sessions() => {
                // a resuming download still runs on this endpoint
                endpoint
                    .reconnect_from(generation)
                    .await
                    .inspect_err(|e| warn!(device_id = %slot.device_id(), error = %e, "redial failed"))?;
                slot.mark_replaced(endpoint.generation());
                return Ok(endpoint);
            }
            Some((_, Some(_))) => self.teardown(slot, "connection lost").await,
        }

        let transport = self.config.read().transport.clone();
        let endpoint = self
            .factory
            .connect(record, hint, &transport)
            .await
            .inspect_err(|e| warn!(device_id = %slot.device_id(), %hint, error = %e, "connect failed"))?;
        let inbound = endpoint.inbound()?;
        let status = endpoint.subscribe_status();
        let kind = endpoint.kind();

        let weak: Weak<RegistryInner> = Arc::downgrade(self);
        let tasks = vec![
            tokio::spawn(dispatch::run_inbound(weak.clone(), slot.clone(), endpoint.clone(), inbound)),
            tokio::spawn(dispatch::watch_status(weak, slot.clone(), status)),
        ];

        let recorder = {
            let mut state = slot.state.lock();
            state.connection = Some(Connection {
                endpoint: endpoint.clone(),
                tasks,
                lost_at: None,
            });
            state.info.as_mut().is_some_and(|info| {
                info.status = OnlineStatus::Active;
                info.transport = Some(kind);
                info.device_type.is_recorder()
            })
        };

        info!(device_id = %slot.device_id(), endpoint_id = %endpoint.id(), %kind, "endpoint ready");
        let device_id = slot.device_id().to_string();
        self.sink
            .emit(Event::Connected {
                device_id: device_id.clone(),
                kind,
            })
            .await;
        self.sink
            .emit(Event::DeviceStatus {
                device_id,
                status: OnlineStatus::Active,
                recorder,
            })
            .await;
        Ok(endpoint)
    }

    /// Close the device's endpoint, waking its waiters with `Cancelled`
    async fn teardown(&self, slot: &DeviceSlot, reason: &str) {
        let connection = {
            let mut state = slot.state.lock();
            state.reassembler.reset();
            if let Some(info) = state.info.as_mut() {
                info.transport = None;
            }
            state.connection.take()
        };
        let Some(connection) = connection else {
            return;
        };

        let endpoint_id = connection.endpoint.id();
        let cancelled = self.correlator.cancel_channel(endpoint_id);
        if let Err(e) = connection.endpoint.close().await {
            debug!(device_id = %slot.device_id(), error = %e, "endpoint close failed");
        }
        for task in connection.tasks {
            task.abort();
        }
        info!(device_id = %slot.device_id(), %endpoint_id, reason, cancelled, "endpoint torn down");
    }

    /// Tear the endpoint down once no session and no command needs it.
    /// Caller holds the device lock.
    async fn release_if_idle(&self, slot: &DeviceSlot) {
        let endpoint = {
            let state = slot.state.lock();
            if !state.sessions.is_empty() {
                return;
            }
            state.connection.as_ref().map(|c| c.endpoint.clone())
        };
        let Some(endpoint) = endpoint else {
            return;
        };
        self.correlator.wait_idle(endpoint.id()).await;
        if slot.state.lock().sessions.is_empty() {
            self.teardown(slot, "no sessions left").await;
        }
    }

    /// A request envelope addressed the way this device expects
    pub(crate) fn command(&self, slot: &DeviceSlot, code: CommandCode, channel: Option<u16>) -> CommandEnvelope {
        let envelope = CommandEnvelope::request(code, slot.device_id());
        let Some(device_type) = slot.info().map(|info| info.device_type) else {
            return match channel {
                Some(c) => envelope.with_channel(c),
                None => envelope,
            };
        };
        match (route_for(device_type, code.family, channel), channel) {
            (Route::Transparent(c), _) => envelope.with_route(Route::Transparent(c)),
            (Route::Direct, Some(c)) => envelope.with_channel(c),
            (Route::Direct, None) => envelope,
        }
    }

    /// Send a request and turn a device-side failure into an error
    pub(crate) async fn exchange(
        &self,
        endpoint: &Endpoint,
        envelope: CommandEnvelope,
        owner: Option<OwnerId>,
    ) -> Result<CommandEnvelope> {
        let channel = envelope.channel.or(envelope.route.transparent_channel());
        let response = self
            .correlator
            .request(endpoint, endpoint.id(), envelope, owner)
            .await?;
        if !response.is_success() {
            return Err(Error::from_device_result(response.result, channel));
        }
        Ok(response)
    }

    /// Move a session and tell the application
    pub(crate) async fn set_state(&self, cell: &SessionCell, next: SessionState) -> Result<()> {
        let from = cell.transition(next)?;
        self.sink
            .emit(Event::SessionState {
                handle: cell.handle(),
                from,
                to: next,
            })
            .await;
        Ok(())
    }

    /// Put a session into `Error` and cancel its commands
    pub(crate) async fn fail_session(&self, cell: &SessionCell, error: Error) {
        let from = cell.state();
        if from.is_terminal() {
            return;
        }
        warn!(session_id = %cell.id(), state = %from, error = %error, "session failed");
        cell.fail(error);
        self.correlator.cancel_owned_by(cell.id().0);
        self.sink
            .emit(Event::SessionState {
                handle: cell.handle(),
                from,
                to: SessionState::Error,
            })
            .await;
    }

    /// Fail the session if it is still negotiating after the timeout
    pub(crate) fn watch_negotiation(self: &Arc<Self>, cell: Arc<SessionCell>) {
        let timeout = self.config.read().session.negotiation_timeout();
        let weak = Arc::downgrade(self);
        let mut states = cell.subscribe();
        tokio::spawn(async move {
            let timed_out = tokio::time::timeout(
                timeout,
                states.wait_for(|state| *state != SessionState::Negotiating),
            )
            .await
            .is_err();
            if !timed_out || cell.state() != SessionState::Negotiating {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner
                    .fail_session(&cell, TransportFault::HandshakeTimeout(timeout).into())
                    .await;
            }
        });
    }

    /// Requesting → Negotiating once the start request is answered. Media
    /// that overtook the answer is delivered now as the first frames.
    async fn start_negotiation(self: &Arc<Self>, slot: &DeviceSlot, cell: &Arc<SessionCell>) -> Result<()> {
        self.set_state(cell, SessionState::Negotiating).await?;
        self.watch_negotiation(cell.clone());
        if cell.has_early_media() && dispatch::first_frame(self, cell).await {
            dispatch::deliver_in_order(self, slot, cell, None);
        }
        Ok(())
    }

    /// Run the start handshake of a new session
    async fn negotiate(self: &Arc<Self>, slot: &DeviceSlot, cell: &Arc<SessionCell>, endpoint: &Endpoint) -> Result<()> {
        let (kind, stream_index, channel) =
            cell.with(|s| (s.handle.key.kind, s.handle.key.stream_index, s.channel));
        let owner = owner_of(cell);

        match kind {
            SessionKind::Watch => {
                let request = self
                    .command(slot, live::START_WATCH, channel)
                    .with_json(&WatchRequest { stream_index, channel })?;
                let response = self.exchange(endpoint, request, owner).await?;
                let watch: WatchResponse = decode_body(&response)?;
                cell.with(|s| s.watch = Some(watch));
                self.start_negotiation(slot, cell).await?;
            }
            SessionKind::Talk => {
                let response = self
                    .exchange(endpoint, self.command(slot, live::START_TALK, channel), owner)
                    .await?;
                let talk: TalkResponse = decode_body(&response)?;
                cell.with(|s| s.talk = Some(talk));
                self.set_state(cell, SessionState::Negotiating).await?;
                self.exchange(endpoint, self.command(slot, live::TALK_AUDIO_OPEN, channel), owner)
                    .await?;
                self.set_state(cell, SessionState::Active).await?;
            }
            SessionKind::Replay => {
                let request = cell
                    .with(|s| s.replay_request.clone())
                    .ok_or_else(|| Error::invalid_argument("replay needs a replay request"))?;
                let envelope = self
                    .command(slot, replay::PLAY_START, channel)
                    .with_json(&request)?;
                let response = self.exchange(endpoint, envelope, owner).await?;
                let body: ReplayResponse = decode_body(&response)?;
                cell.with(|s| s.replay = Some(body));
                self.start_negotiation(slot, cell).await?;
            }
            SessionKind::Download => self.start_download(slot, cell, endpoint).await?,
            SessionKind::Upload => {
                let request = cell
                    .with(|s| s.upload.as_ref().map(|u| u.request.clone()))
                    .ok_or_else(|| Error::invalid_argument("upload needs an upload request"))?;
                let envelope = self
                    .command(slot, system::UPLOAD_START, channel)
                    .with_json(&request)?;
                self.exchange(endpoint, envelope, owner).await?;
                self.set_state(cell, SessionState::Negotiating).await?;
                self.set_state(cell, SessionState::Active).await?;
            }
            SessionKind::Config => {
                self.exchange(endpoint, self.command(slot, system::CONFIG_OPEN, channel), owner)
                    .await?;
                self.set_state(cell, SessionState::Negotiating).await?;
                self.set_state(cell, SessionState::Active).await?;
            }
        }
        Ok(())
    }

    /// Ask for the download from the session's offset. A rejected offset
    /// restarts the file from zero once.
    pub(crate) async fn start_download(
        self: &Arc<Self>,
        slot: &DeviceSlot,
        cell: &Arc<SessionCell>,
        endpoint: &Endpoint,
    ) -> Result<()> {
        let (request, channel) = cell.with(|s| {
            let request = s.download.as_ref().map(|d| {
                let mut request = d.request.clone();
                request.offset = d.offset;
                request
            });
            (request, s.channel)
        });
        let mut request = request.ok_or_else(|| Error::invalid_argument("download needs a download request"))?;
        slot.reset_media_stream(DOWNLOAD_STREAM_INDEX);

        loop {
            let envelope = self
                .command(slot, replay::DOWNLOAD_START, channel)
                .with_json(&request)?;
            match self.exchange(endpoint, envelope, owner_of(cell)).await {
                Ok(_) => break,
                Err(Error::Session(SessionFault::OffsetInvalid)) if request.offset > 0 => {
                    info!(
                        session_id = %cell.id(),
                        offset = request.offset,
                        "download offset rejected, restarting from zero"
                    );
                    request.offset = 0;
                    cell.with(|s| {
                        s.early_media.clear();
                        if let Some(download) = s.download.as_mut() {
                            download.offset = 0;
                        }
                    });
                }
                Err(e) => return Err(e),
            }
        }

        debug!(session_id = %cell.id(), offset = request.offset, "download requested");
        self.start_negotiation(slot, cell).await
    }

    /// The request that stops a session of `kind`, if it has one
    fn stop_request(&self, slot: &DeviceSlot, cell: &SessionCell) -> Result<Option<CommandEnvelope>> {
        let (kind, stream_index, channel) =
            cell.with(|s| (s.handle.key.kind, s.handle.key.stream_index, s.channel));
        let envelope = match kind {
            SessionKind::Watch => self
                .command(slot, live::STOP_WATCH, channel)
                .with_json(&StreamSelect { stream_index })?,
            SessionKind::Talk => self.command(slot, live::STOP_TALK, channel),
            SessionKind::Replay => self
                .command(slot, replay::action(ReplayAction::Stop), channel)
                .with_json(&ReplayControl {
                    action: ReplayAction::Stop,
                    value: None,
                })?,
            SessionKind::Download => self.command(slot, replay::DOWNLOAD_STOP, channel),
            SessionKind::Config => self.command(slot, system::CONFIG_CLOSE, channel),
            SessionKind::Upload => return Ok(None),
        };
        Ok(Some(envelope))
    }

    /// Draining, then Closed. Waits at most `drain_grace` for the device.
    async fn drain(&self, slot: &DeviceSlot, cell: &SessionCell) {
        let state = cell.state();
        if state.is_terminal() {
            return;
        }
        if state != SessionState::Draining && self.set_state(cell, SessionState::Draining).await.is_err() {
            return;
        }

        let endpoint = slot.endpoint().filter(|e| !e.is_closed());
        let stop = match self.stop_request(slot, cell) {
            Ok(stop) => stop,
            Err(e) => {
                debug!(session_id = %cell.id(), error = %e, "cannot build stop request");
                None
            }
        };
        if let (Some(endpoint), Some(stop)) = (endpoint, stop) {
            let options = RequestOptions {
                timeout: self.config.read().session.drain_grace(),
                attempts: 1,
            };
            match self
                .correlator
                .request_with(&endpoint, endpoint.id(), stop, None, options)
                .await
            {
                Ok(_) => debug!(session_id = %cell.id(), "stop acknowledged"),
                Err(e) => warn!(session_id = %cell.id(), error = %e, "no stop acknowledgment, force-closing"),
            }
        }
        let _ = self.set_state(cell, SessionState::Closed).await;
    }

    /// Drop a session whose start failed
    async fn discard(&self, slot: &DeviceSlot, cell: &SessionCell) {
        let _guard = slot.lock.lock().await;
        slot.remove_session(cell);
        self.release_if_idle(slot).await;
    }

    /// Close every session of a device without waiting for the device
    async fn force_close_all(&self, slot: &DeviceSlot) {
        let sessions: Vec<_> = slot.state.lock().sessions.drain().map(|(_, cell)| cell).collect();
        for cell in sessions {
            self.correlator.cancel_owned_by(cell.id().0);
            if cell.state().is_terminal() {
                continue;
            }
            if cell.state() != SessionState::Draining {
                let _ = self.set_state(&cell, SessionState::Draining).await;
            }
            let _ = self.set_state(&cell, SessionState::Closed).await;
        }
    }
}

/// Sessions, endpoints and devices of one application
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("devices", &self.inner.devices.len())
            .field("pending_commands", &self.inner.correlator.pending_count())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(
        config: CamlinkConfig,
        directory: Arc<dyn DeviceDirectory>,
        factory: Arc<dyn EndpointFactory>,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let sink = EventSink::new(handler, config.session.event_queue_capacity);
        let correlator = CommandCorrelator::new(config.command.clone());
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config: RwLock::new(config),
                directory,
                factory,
                correlator,
                sink,
                devices: DashMap::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// A registry that dials real sockets
    pub fn with_network(
        config: CamlinkConfig,
        directory: Arc<dyn DeviceDirectory>,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self> {
        Self::new(config, directory, Arc::new(NetworkEndpointFactory), handler)
    }

    pub fn config(&self) -> CamlinkConfig {
        self.inner.config()
    }

    /// Open a session, or return the live one with the same key.
    ///
    /// `stream_index` selects main (0) or sub (1) stream for watches. Replay
    /// and download sessions always use their own media stream index.
    pub async fn open(
        &self,
        device_id: &str,
        kind: SessionKind,
        stream_index: u8,
        params: OpenParams,
    ) -> Result<SessionHandle> {
        let inner = &self.inner;
        inner.ensure_running()?;

        let stream_index = match kind {
            SessionKind::Watch if stream_index > 1 => {
                return Err(Error::invalid_argument(format!(
                    "watch stream index {} (0 main, 1 sub)",
                    stream_index
                )));
            }
            SessionKind::Replay if params.replay.is_none() => {
                return Err(Error::invalid_argument("replay needs a replay request"));
            }
            SessionKind::Download if params.download.is_none() => {
                return Err(Error::invalid_argument("download needs a download request"));
            }
            SessionKind::Upload if params.upload.is_none() => {
                return Err(Error::invalid_argument("upload needs an upload request"));
            }
            SessionKind::Replay => REPLAY_STREAM_INDEX,
            SessionKind::Download => DOWNLOAD_STREAM_INDEX,
            _ => stream_index,
        };
        let key = SessionKey {
            device_id: device_id.to_string(),
            kind,
            stream_index,
        };

        let slot = inner.slot(device_id);
        let (cell, endpoint) = {
            let _guard = slot.lock.lock().await;
            if let Some(draining) = slot.draining_session(&key) {
                debug!(device_id, %kind, stream_index, session_id = %draining.id(), "waiting for previous session to drain");
                let mut states = draining.subscribe();
                let _ = states.wait_for(|state| state.is_terminal()).await;
            }
            if let Some(existing) = slot.live_session(&key) {
                debug!(device_id, %kind, stream_index, session_id = %existing.id(), "session already open");
                return Ok(existing.handle());
            }

            let record = inner.resolve_device(&slot).await?;
            inner.check_usable(&slot, params.channel)?;

            let force_relay = inner.config.read().transport.force_substream_by_relay;
            let hint = params.transport_hint.unwrap_or(
                if force_relay && kind == SessionKind::Watch && stream_index == 1 {
                    TransportHint::RelayOnly
                } else {
                    TransportHint::Auto
                },
            );
            let endpoint = inner.ensure_connection(&slot, &record, hint).await?;

            let handle = SessionHandle {
                id: SessionId::next(),
                key: key.clone(),
            };
            let cell = Arc::new(SessionCell::new(handle, &params));
            if let Some(index) = cell.media_stream_index() {
                slot.reset_media_stream(index);
            }
            slot.state.lock().sessions.insert(key, cell.clone());
            info!(device_id, session_id = %cell.id(), %kind, stream_index, "session opened");
            (cell, endpoint)
        };

        if let Err(e) = inner.negotiate(&slot, &cell, &endpoint).await {
            if !e.is_cancelled() {
                inner.fail_session(&cell, e.clone()).await;
            }
            inner.discard(&slot, &cell).await;
            return Err(e);
        }
        Ok(cell.handle())
    }

    /// Stop a session. The device gets `drain_grace` to acknowledge; the
    /// endpoint goes away with the device's last session.
    pub async fn close(&self, handle: &SessionHandle) -> Result<()> {
        let inner = &self.inner;
        let (slot, cell) = inner.session_cell(handle)?;

        let cancelled = inner.correlator.cancel_owned_by(handle.id.0);
        debug!(session_id = %handle.id, cancelled, "closing session");
        inner.drain(&slot, &cell).await;

        let _guard = slot.lock.lock().await;
        slot.remove_session(&cell);
        inner.release_if_idle(&slot).await;
        info!(device_id = %slot.device_id(), session_id = %handle.id, "session closed");
        Ok(())
    }

    /// Device, transport and sessions of `device_id`
    pub fn lookup(&self, device_id: &str) -> Option<DeviceView> {
        let slot = self.inner.devices.get(device_id)?.clone();
        let state = slot.state.lock();
        let transport = state.connection.as_ref().map(|c| TransportInfo {
            endpoint_id: c.endpoint.id(),
            kind: c.endpoint.kind(),
            peer_addr: c.endpoint.peer_addr(),
            server_instance: c.endpoint.server_instance(),
            generation: c.endpoint.generation(),
            stats: c.endpoint.stats(),
        });
        Some(DeviceView {
            info: state.info.clone(),
            transport,
            sessions: state.sessions.values().map(|cell| cell.info()).collect(),
            reassembly: state.reassembler.stats(),
        })
    }

    pub fn session(&self, handle: &SessionHandle) -> Option<SessionInfo> {
        self.inner.session_cell(handle).ok().map(|(_, cell)| cell.info())
    }

    /// Follow the state of a session
    pub fn subscribe_state(&self, handle: &SessionHandle) -> Result<watch::Receiver<SessionState>> {
        let (_, cell) = self.inner.session_cell(handle)?;
        Ok(cell.subscribe())
    }

    /// Wait until `handle` reaches `state`, at most `timeout`
    pub async fn wait_for_state(&self, handle: &SessionHandle, state: SessionState, timeout: Duration) -> Result<()> {
        let mut states = self.subscribe_state(handle)?;
        let reached = tokio::time::timeout(timeout, states.wait_for(|s| *s == state || s.is_terminal()))
            .await
            .map(|r| r.map(|s| *s));
        match reached {
            Ok(Ok(current)) if current == state => Ok(()),
            Ok(Ok(current)) => Err(Error::invalid_state(current, "wait for state")),
            Ok(Err(_)) => Err(SessionFault::Cancelled.into()),
            Err(_) => Err(TransportFault::HandshakeTimeout(timeout).into()),
        }
    }

    /// Send one command and wait for its answer.
    ///
    /// Opens the endpoint if the device has none and closes it again
    /// afterwards when no session needs it.
    pub async fn request(
        &self,
        device_id: &str,
        code: CommandCode,
        channel: Option<u16>,
        payload: Bytes,
    ) -> Result<CommandEnvelope> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let slot = inner.slot(device_id);

        let endpoint = {
            let _guard = slot.lock.lock().await;
            let record = inner.resolve_device(&slot).await?;
            inner.check_usable(&slot, channel)?;
            inner.ensure_connection(&slot, &record, TransportHint::Auto).await?
        };

        let envelope = inner.command(&slot, code, channel).with_payload(payload);
        let result = inner.exchange(&endpoint, envelope, None).await;

        let _guard = slot.lock.lock().await;
        inner.release_if_idle(&slot).await;
        result
    }

    /// Switch a watch between main and sub stream, or a replay's stream.
    ///
    /// Rejected with `InvalidState` unless the session is `Active`.
    pub async fn switch_stream(&self, handle: &SessionHandle, stream_index: u8) -> Result<SessionHandle> {
        let inner = &self.inner;
        let (slot, cell) = inner.session_cell(handle)?;
        let state = cell.state();
        if state != SessionState::Active {
            return Err(Error::invalid_state(state, "switch stream"));
        }
        if stream_index > 1 {
            return Err(Error::invalid_argument(format!("stream index {}", stream_index)));
        }

        let kind = cell.kind();
        let channel = cell.with(|s| s.channel);
        let request = || -> Result<CommandEnvelope> {
            Ok(inner
                .command(&slot, live::CHANGE_STREAM, channel)
                .with_json(&StreamSelect { stream_index })?)
        };
        let endpoint = slot
            .endpoint()
            .ok_or(Error::Transport(TransportFault::EndpointClosed))?;

        match kind {
            SessionKind::Replay => {
                inner.exchange(&endpoint, request()?, owner_of(&cell)).await?;
                Ok(cell.handle())
            }
            SessionKind::Watch => {
                let old_index = handle.stream_index();
                if old_index == stream_index {
                    return Ok(cell.handle());
                }
                let new_key = SessionKey {
                    stream_index,
                    ..handle.key.clone()
                };
                if slot.live_session(&new_key).is_some() {
                    return Err(SessionFault::Busy.into());
                }

                inner.exchange(&endpoint, request()?, owner_of(&cell)).await?;

                {
                    let _guard = slot.lock.lock().await;
                    let mut state = slot.state.lock();
                    if state.sessions.contains_key(&new_key) {
                        return Err(SessionFault::Busy.into());
                    }
                    state.sessions.retain(|_, c| c.id() != cell.id());
                    cell.with(|s| s.handle.key.stream_index = stream_index);
                    state.sessions.insert(new_key, cell.clone());
                }
                slot.reset_media_stream(old_index);
                inner.set_state(&cell, SessionState::Negotiating).await?;
                inner.watch_negotiation(cell.clone());
                info!(session_id = %cell.id(), from = old_index, to = stream_index, "stream switched");
                Ok(cell.handle())
            }
            other => Err(Error::invalid_argument(format!("cannot switch the stream of a {} session", other))),
        }
    }

    /// Close every session of the device and its endpoint, and refuse new
    /// work until [`SessionRegistry::resume_communication`]
    pub async fn stop_communication(&self, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        let slot = inner.existing_slot(device_id)?;
        let _guard = slot.lock.lock().await;
        slot.update_info(|info| info.communication_stopped = true);
        inner.force_close_all(&slot).await;
        inner.teardown(&slot, "communication stopped").await;
        info!(device_id, "communication stopped");
        Ok(())
    }

    pub fn resume_communication(&self, device_id: &str) -> Result<()> {
        let slot = self.inner.existing_slot(device_id)?;
        slot.update_info(|info| info.communication_stopped = false);
        info!(device_id, "communication resumed");
        Ok(())
    }

    /// Record a status the application learned elsewhere
    pub async fn set_device_status(&self, device_id: &str, status: OnlineStatus) -> Result<()> {
        let slot = self.inner.existing_slot(device_id)?;
        let recorder = slot
            .update_info(|info| {
                info.status = status;
                info.device_type.is_recorder()
            })
            .ok_or_else(|| Error::not_found(device_id))?;
        self.inner
            .sink
            .emit(Event::DeviceStatus {
                device_id: device_id.to_string(),
                status,
                recorder,
            })
            .await;
        Ok(())
    }

    /// Close everything for the device and forget it
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        let slot = inner.existing_slot(device_id)?;
        for cell in slot.sessions() {
            inner.correlator.cancel_owned_by(cell.id().0);
            inner.drain(&slot, &cell).await;
        }
        {
            let _guard = slot.lock.lock().await;
            slot.state.lock().sessions.clear();
            inner.teardown(&slot, "device removed").await;
        }
        inner.devices.remove(device_id);
        inner.sink.remove_device(device_id);
        info!(device_id, "device removed");
        Ok(())
    }

    /// Commands waiting for a response or queued behind one
    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.inner.correlator.pending()
    }

    /// Media frames dropped because an event queue was full
    pub fn dropped_media(&self) -> u64 {
        self.inner.sink.dropped_media()
    }

    /// Unregister the handler, close every endpoint and refuse further work
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.sink.shutdown();
        let slots: Vec<_> = inner.devices.iter().map(|entry| entry.value().clone()).collect();
        for slot in slots {
            let _guard = slot.lock.lock().await;
            inner.force_close_all(&slot).await;
            inner.teardown(&slot, "shutdown").await;
        }
        inner.devices.clear();
        info!("session registry shut down");
    }
}
