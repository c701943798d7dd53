//! Per-endpoint background tasks: the inbound frame router and the status
//! watcher.
//!
//! Both hold only a weak reference to the registry and stop when it is gone.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use camlink_command_core::{CommandEnvelope, EnvelopeKind};
use camlink_stream_core::MediaFrame;
use camlink_transport_core::{Endpoint, EndpointStatus, InboundStream, PacketType, TransportKind};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use super::{DeviceSlot, RegistryInner, decode_body};
use crate::commands::{notify, replay, system};
use crate::device::{ChannelStatus, OnlineStatus};
use crate::errors::{Error, SessionFault, TransportFault};
use crate::events::{Event, MediaEvent, MediaExt};
use crate::recovery::retry_with_backoff;
use crate::session::{
    AlarmInfo, ChannelNotice, DownloadProgress, EventInfo, SessionCell, SessionKind, SessionState,
    UploadProgress,
};

/// Route every inbound frame of `endpoint` until it closes
pub(super) async fn run_inbound(
    registry: Weak<RegistryInner>,
    slot: Arc<DeviceSlot>,
    endpoint: Endpoint,
    mut inbound: InboundStream,
) {
    debug!(device_id = %slot.device_id(), endpoint_id = %endpoint.id(), "inbound router started");
    while let Some(frame) = inbound.next_frame().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        match frame.packet_type() {
            PacketType::Media => on_media(&inner, &slot, frame.body).await,
            PacketType::Control => on_control(&inner, &slot, &endpoint, frame.body).await,
            other => trace!(device_id = %slot.device_id(), packet_type = ?other, "ignoring frame"),
        }
    }
    debug!(device_id = %slot.device_id(), endpoint_id = %endpoint.id(), "inbound router stopped");
}

async fn on_media(inner: &RegistryInner, slot: &DeviceSlot, body: Bytes) {
    let frame = match slot.with_reassembler(|r| r.feed_bytes(body)) {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(e) => {
            trace!(device_id = %slot.device_id(), error = %e, "dropping stream packet");
            return;
        }
    };
    if !frame.stream_type.is_media() {
        return;
    }

    let Some(cell) = slot.session_for_stream(frame.stream_index) else {
        trace!(
            device_id = %slot.device_id(),
            stream_index = frame.stream_index,
            "media for a stream nobody watches"
        );
        return;
    };

    let Some(frame) = cell.hold_early(frame) else {
        trace!(session_id = %cell.id(), "holding media until the start request is answered");
        return;
    };

    match cell.state() {
        SessionState::Negotiating => {
            if !first_frame(inner, &cell).await {
                return;
            }
        }
        state if state.is_streaming() => {}
        state => {
            trace!(session_id = %cell.id(), %state, "dropping media outside streaming states");
            return;
        }
    }

    deliver_in_order(inner, slot, &cell, Some(frame));
}

/// Negotiating → Active on the first frame. False when the session has
/// left the streaming states meanwhile.
pub(super) async fn first_frame(inner: &RegistryInner, cell: &SessionCell) -> bool {
    match inner.set_state(cell, SessionState::Active).await {
        Ok(()) => {
            info!(session_id = %cell.id(), "first media frame, session active");
            true
        }
        Err(e) if !cell.state().is_streaming() => {
            debug!(session_id = %cell.id(), error = %e, "first frame after state change");
            false
        }
        // another frame got there first
        Err(_) => true,
    }
}

/// Hand held-back frames, then `frame`, to the sink
pub(super) fn deliver_in_order(inner: &RegistryInner, slot: &DeviceSlot, cell: &SessionCell, frame: Option<MediaFrame>) {
    let _order = cell.delivery_lock();
    for early in cell.take_early_media() {
        deliver(inner, slot, cell, early);
    }
    if let Some(frame) = frame {
        deliver(inner, slot, cell, frame);
    }
}

fn deliver(inner: &RegistryInner, slot: &DeviceSlot, cell: &SessionCell, frame: MediaFrame) {
    let len = frame.len() as u64;
    let (handle, channel) = cell.with(|s| {
        s.frames_received += 1;
        s.last_frame_index = Some(frame.frame_index);
        if let Some(download) = s.download.as_mut() {
            download.offset += len;
        }
        (s.handle.clone(), s.channel)
    });

    let ext = MediaExt {
        key_frame: frame.key_frame,
        timestamp: frame.timestamp,
        channel,
    };
    let media = MediaEvent {
        device_id: slot.device_id().to_string(),
        handle,
        media_type: frame.stream_type,
        frame,
        ext,
    };
    inner.sink().emit_media(media);
}

async fn on_control(inner: &Arc<RegistryInner>, slot: &Arc<DeviceSlot>, endpoint: &Endpoint, body: Bytes) {
    let envelope = match CommandEnvelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(device_id = %slot.device_id(), error = %e, "dropping malformed control frame");
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::Response => {
            let event = Event::Response {
                device_id: slot.device_id().to_string(),
                code: envelope.code,
                result: envelope.result,
                channel: envelope.channel.or(envelope.route.transparent_channel()),
                payload: envelope.payload.clone(),
            };
            let code = envelope.code;
            if !inner.correlator().resolve(endpoint.id(), envelope) {
                trace!(device_id = %slot.device_id(), %code, "response without a waiter");
            }
            inner.sink().emit(event).await;
        }
        EnvelopeKind::Notify => on_notification(inner, slot, envelope).await,
        EnvelopeKind::Request => {
            debug!(device_id = %slot.device_id(), code = %envelope.code, "ignoring request from device");
        }
    }
}

/// Decode a notification body, logging and skipping it when malformed
fn notice_body<T: serde::de::DeserializeOwned + Default>(envelope: &CommandEnvelope) -> Option<T> {
    match decode_body(envelope) {
        Ok(body) => Some(body),
        Err(e) => {
            debug!(code = %envelope.code, error = %e, "malformed notification body");
            None
        }
    }
}

async fn on_notification(inner: &Arc<RegistryInner>, slot: &Arc<DeviceSlot>, envelope: CommandEnvelope) {
    let device_id = slot.device_id().to_string();
    let channel = envelope.channel.or(envelope.route.transparent_channel());

    match envelope.code {
        notify::ALARM => {
            if !slot.auto_receive_alarm() {
                trace!(device_id = %device_id, "alarm suppressed");
                return;
            }
            let Some(mut info) = notice_body::<AlarmInfo>(&envelope) else {
                return;
            };
            if info.channel.is_none() {
                info.channel = channel;
            }
            inner.sink().emit(Event::Alarm { device_id, info }).await;
        }
        notify::EVENT => {
            let Some(info) = notice_body::<EventInfo>(&envelope) else {
                return;
            };
            inner.sink().emit(Event::DeviceEvent { device_id, info }).await;
        }
        notify::DEVICE_OFFLINE => {
            connection_lost(inner, slot, OnlineStatus::Offline, TransportFault::P2PDisconnected.into(), false).await;
        }
        notify::CHANNEL_OFFLINE | notify::CHANNEL_ONLINE | notify::CHANNEL_UNCONNECTED => {
            let status = match envelope.code {
                notify::CHANNEL_OFFLINE => ChannelStatus::Offline,
                notify::CHANNEL_UNCONNECTED => ChannelStatus::Unconnected,
                _ => ChannelStatus::Online,
            };
            let notice = match channel {
                Some(channel) => ChannelNotice { channel },
                None => match notice_body::<ChannelNotice>(&envelope) {
                    Some(notice) => notice,
                    None => return,
                },
            };
            channel_changed(inner, slot, notice.channel, status).await;
        }
        notify::AUTH_FAILED => {
            warn!(device_id = %device_id, "device rejected credentials");
            inner.sink().emit(Event::AuthFailed { device_id }).await;
            for cell in slot.sessions() {
                inner.fail_session(&cell, SessionFault::AuthFailed.into()).await;
            }
        }
        system::UPLOAD_PROGRESS => {
            let Some(progress) = notice_body::<UploadProgress>(&envelope) else {
                return;
            };
            for cell in slot.sessions_of_kind(SessionKind::Upload) {
                if cell.state().is_terminal() {
                    continue;
                }
                inner
                    .sink()
                    .emit(Event::UploadProgress {
                        handle: cell.handle(),
                        progress,
                    })
                    .await;
            }
        }
        replay::DOWNLOAD_PROGRESS => {
            let Some(progress) = notice_body::<DownloadProgress>(&envelope) else {
                return;
            };
            for cell in slot.sessions_of_kind(SessionKind::Download) {
                if cell.state().is_terminal() {
                    continue;
                }
                let progress = cell.with(|s| match s.download.as_mut() {
                    Some(download) => {
                        download.total = progress.total;
                        DownloadProgress {
                            received: download.offset.max(progress.received),
                            total: progress.total,
                        }
                    }
                    None => progress,
                });
                inner
                    .sink()
                    .emit(Event::DownloadProgress {
                        handle: cell.handle(),
                        progress,
                    })
                    .await;
            }
        }
        replay::DOWNLOAD_END => {
            for cell in slot.sessions_of_kind(SessionKind::Download) {
                download_finished(inner, &cell).await;
            }
        }
        other => debug!(device_id = %device_id, code = %other, "unhandled notification"),
    }
}

async fn channel_changed(inner: &RegistryInner, slot: &DeviceSlot, channel: u16, status: ChannelStatus) {
    let known = slot.update_info(|info| {
        if channel >= info.channel_count && info.device_type.is_recorder() {
            return false;
        }
        info.channels.insert(channel, status);
        true
    });
    if known == Some(false) {
        debug!(device_id = %slot.device_id(), channel, "status for an unknown channel");
        return;
    }
    info!(device_id = %slot.device_id(), channel, ?status, "channel status changed");
    inner
        .sink()
        .emit(Event::ChannelStatus {
            device_id: slot.device_id().to_string(),
            channel,
            status,
        })
        .await;

    let error: Error = match status {
        ChannelStatus::Online => return,
        ChannelStatus::Offline => SessionFault::ChannelOffline(channel).into(),
        ChannelStatus::Unconnected => SessionFault::ChannelUnconnected(channel).into(),
    };
    for cell in slot.sessions() {
        if cell.with(|s| s.channel) == Some(channel) {
            inner.fail_session(&cell, error.clone()).await;
        }
    }
}

async fn download_finished(inner: &RegistryInner, cell: &SessionCell) {
    let state = cell.state();
    if !matches!(state, SessionState::Active | SessionState::Negotiating) {
        trace!(session_id = %cell.id(), %state, "download end outside a transfer");
        return;
    }
    if inner.set_state(cell, SessionState::Draining).await.is_err() {
        return;
    }
    let _ = inner.set_state(cell, SessionState::Closed).await;
    let bytes = cell.with(|s| s.download.as_ref().map_or(0, |d| d.offset));
    info!(session_id = %cell.id(), bytes, "download complete");
    inner
        .sink()
        .emit(Event::DownloadComplete {
            handle: cell.handle(),
            bytes,
        })
        .await;
}

/// Follow the endpoint's connectivity until it closes
pub(super) async fn watch_status(
    registry: Weak<RegistryInner>,
    slot: Arc<DeviceSlot>,
    mut status: broadcast::Receiver<EndpointStatus>,
) {
    loop {
        let update = match status.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                warn!(device_id = %slot.device_id(), skipped, "status updates lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = registry.upgrade() else {
            break;
        };

        match update {
            EndpointStatus::HeartbeatLost => {
                connection_lost(
                    &inner,
                    &slot,
                    OnlineStatus::HeartbeatLost,
                    TransportFault::HeartbeatLost.into(),
                    true,
                )
                .await;
            }
            EndpointStatus::ConnectionLost { reason } => {
                connection_lost(&inner, &slot, OnlineStatus::Offline, TransportFault::Socket(reason).into(), true)
                    .await;
            }
            EndpointStatus::Reconnected { kind, generation } => reconnected(&inner, &slot, kind, generation).await,
            EndpointStatus::Connected { .. } => {}
            EndpointStatus::Closed => break,
        }
    }
    trace!(device_id = %slot.device_id(), "status watcher stopped");
}

/// Report the device down and deal with its sessions.
///
/// Running downloads go back to `Requesting` and resume from their offset
/// once the endpoint reconnects when `resume` is set; every other live
/// session fails.
async fn connection_lost(
    inner: &Arc<RegistryInner>,
    slot: &Arc<DeviceSlot>,
    status: OnlineStatus,
    error: Error,
    resume: bool,
) {
    warn!(device_id = %slot.device_id(), %status, error = %error, "device connection lost");
    slot.mark_lost();
    let recorder = slot
        .update_info(|info| {
            info.status = status;
            info.device_type.is_recorder()
        })
        .unwrap_or(false);
    inner
        .sink()
        .emit(Event::DeviceStatus {
            device_id: slot.device_id().to_string(),
            status,
            recorder,
        })
        .await;

    for cell in slot.sessions() {
        let state = cell.state();
        if state.is_terminal() || state == SessionState::Draining {
            continue;
        }
        if cell.kind() == SessionKind::Download {
            if state == SessionState::Requesting {
                // resume already in progress
                continue;
            }
            if resume && cell.transition(SessionState::Requesting).is_ok() {
                inner
                    .sink()
                    .emit(Event::SessionState {
                        handle: cell.handle(),
                        from: state,
                        to: SessionState::Requesting,
                    })
                    .await;
                inner.correlator().cancel_owned_by(cell.id().0);
                tokio::spawn(resume_download(Arc::downgrade(inner), slot.clone(), cell.clone()));
                continue;
            }
        }
        inner.fail_session(&cell, error.clone()).await;
    }
}

async fn resume_download(registry: Weak<RegistryInner>, slot: Arc<DeviceSlot>, cell: Arc<SessionCell>) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let offset = cell.with(|s| s.download.as_ref().map_or(0, |d| d.offset));
    info!(session_id = %cell.id(), offset, "resuming download after reconnect");

    let result = match slot.endpoint() {
        Some(endpoint) => {
            let retry = inner.config().session.reconnect_retry();
            let target = &endpoint;
            let reconnected = retry_with_backoff("download reconnect", &retry, move || async move {
                target.reconnect().await.map_err(Error::from)
            })
            .await;
            match reconnected {
                Ok(()) if cell.state() != SessionState::Requesting => {
                    debug!(session_id = %cell.id(), "download closed while reconnecting");
                    return;
                }
                Ok(()) => inner.start_download(&slot, &cell, &endpoint).await,
                Err(e) => Err(e),
            }
        }
        None => Err(TransportFault::EndpointClosed.into()),
    };

    if let Err(e) = result {
        if cell.state().is_terminal() {
            return;
        }
        let reason = e.to_string();
        inner.fail_session(&cell, e).await;
        inner
            .sink()
            .emit(Event::DownloadFailed {
                handle: cell.handle(),
                reason,
            })
            .await;
    }
}

async fn reconnected(inner: &RegistryInner, slot: &DeviceSlot, kind: TransportKind, generation: u64) {
    info!(device_id = %slot.device_id(), %kind, generation, "device reconnected");
    slot.mark_replaced(generation);
    let recorder = slot
        .update_info(|info| {
            info.status = OnlineStatus::Active;
            info.transport = Some(kind);
            info.device_type.is_recorder()
        })
        .unwrap_or(false);
    let device_id = slot.device_id().to_string();
    inner
        .sink()
        .emit(Event::Connected {
            device_id: device_id.clone(),
            kind,
        })
        .await;
    inner
        .sink()
        .emit(Event::DeviceStatus {
            device_id,
            status: OnlineStatus::Active,
            recorder,
        })
        .await;
}
