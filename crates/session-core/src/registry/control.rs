//! Device-control operations layered on sessions and the correlator:
//! PTZ, key frames, recording search, replay controls, talk audio, upload
//! and the registry-wide switches.

use std::time::Duration;

use bytes::Bytes;
use camlink_command_core::{CommandCode, CommandEnvelope, MessageFamily};
use camlink_transport_core::PacketType;
use tracing::{debug, info, warn};

use super::{SessionRegistry, decode_body, owner_of};
use crate::commands::{live, replay, system};
use crate::device::DeviceInfo;
use crate::errors::{Error, Result, TransportFault};
use crate::events::Event;
use crate::session::{
    AlarmSubscription, AudioChunk, DownloadProgress, MonthSearch, MonthSearchResponse, PtzCommand,
    PtzRequest, RecordSearch, RecordSearchResponse, RecordSegment, RecordTypeFlags, ReplayAction,
    ReplayControl, SessionHandle, SessionKind, SessionState, StreamSelect, UploadChunk, UploadProgress,
};

fn all_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

impl SessionRegistry {
    async fn resolved_info(&self, device_id: &str) -> Result<DeviceInfo> {
        let slot = self.inner.slot(device_id);
        self.inner.resolve_device(&slot).await?;
        slot.info().ok_or_else(|| Error::not_found(device_id))
    }

    async fn json_request<T: serde::Serialize>(
        &self,
        device_id: &str,
        code: CommandCode,
        channel: Option<u16>,
        body: &T,
    ) -> Result<CommandEnvelope> {
        let payload = Bytes::from(serde_json::to_vec(body)?);
        self.request(device_id, code, channel, payload).await
    }

    /// Generic system-control request with a raw payload
    pub async fn system_control(&self, device_id: &str, code: u16, payload: Bytes) -> Result<CommandEnvelope> {
        let code = CommandCode::new(MessageFamily::SystemControl, code);
        self.request(device_id, code, None, payload).await
    }

    /// Move or adjust a PTZ camera
    pub async fn ptz(
        &self,
        device_id: &str,
        channel: u16,
        command: PtzCommand,
        pan_speed: u8,
        tilt_speed: u8,
    ) -> Result<()> {
        let info = self.resolved_info(device_id).await?;
        if !info.capabilities.ptz {
            return Err(Error::invalid_argument(format!("device {} has no PTZ", device_id)));
        }
        let body = PtzRequest {
            channel,
            command,
            pan_speed,
            tilt_speed,
        };
        debug!(device_id, channel, %command, "PTZ");
        let channel = info.device_type.is_recorder().then_some(channel);
        self.json_request(device_id, system::PTZ, channel, &body).await?;
        Ok(())
    }

    /// Ask the device for a key frame on a watched stream
    pub async fn request_key_frame(&self, device_id: &str, stream_index: u8) -> Result<()> {
        let slot = self.inner.existing_slot(device_id)?;
        let cell = slot
            .sessions_of_kind(SessionKind::Watch)
            .into_iter()
            .find(|cell| cell.handle().stream_index() == stream_index && cell.state().is_streaming())
            .ok_or_else(|| Error::not_found(format!("active watch on stream {}", stream_index)))?;
        let endpoint = slot
            .endpoint()
            .ok_or(Error::Transport(TransportFault::EndpointClosed))?;

        let channel = cell.with(|s| s.channel);
        let envelope = self
            .inner
            .command(&slot, live::REQUEST_KEY_FRAME, channel)
            .with_json(&StreamSelect { stream_index })?;
        self.inner.exchange(&endpoint, envelope, owner_of(&cell)).await?;
        Ok(())
    }

    /// Recorded segments of one day, `day` as `YYYYMMDD`
    pub async fn search_records(
        &self,
        device_id: &str,
        channel: u16,
        day: &str,
        record_types: RecordTypeFlags,
    ) -> Result<Vec<RecordSegment>> {
        if !all_digits(day, 8) {
            return Err(Error::invalid_argument(format!("day {:?} is not YYYYMMDD", day)));
        }
        if record_types.is_empty() {
            return Err(Error::invalid_argument("no record types selected"));
        }
        let body = RecordSearch {
            channel,
            day: day.to_string(),
            record_types,
        };
        let response = self
            .json_request(device_id, replay::SEARCH_RECORDS, Some(channel), &body)
            .await?;
        let found: RecordSearchResponse = decode_body(&response)?;
        debug!(device_id, channel, day, segments = found.segments.len(), "record search");
        Ok(found.segments)
    }

    /// Days of `month` (`YYYYMM`) with recordings
    pub async fn search_by_month(
        &self,
        device_id: &str,
        channel: u16,
        month: &str,
        record_types: RecordTypeFlags,
    ) -> Result<Vec<u8>> {
        if !all_digits(month, 6) {
            return Err(Error::invalid_argument(format!("month {:?} is not YYYYMM", month)));
        }
        let body = MonthSearch {
            channel,
            month: month.to_string(),
            record_types,
        };
        let response = self
            .json_request(device_id, replay::SEARCH_BY_MONTH, Some(channel), &body)
            .await?;
        let found: MonthSearchResponse = decode_body(&response)?;
        Ok(found.days)
    }

    /// Send a replay action and move the session accordingly.
    ///
    /// `value` is the seek target for `Seek` and the speed for `Fast` and
    /// `Slow`. `Stop` closes the session.
    pub async fn replay_control(&self, handle: &SessionHandle, action: ReplayAction, value: Option<u64>) -> Result<()> {
        let inner = &self.inner;
        let (slot, cell) = inner.session_cell(handle)?;
        if cell.kind() != SessionKind::Replay {
            return Err(Error::invalid_argument(format!("{} session has no replay controls", cell.kind())));
        }
        if matches!(action, ReplayAction::Seek) && value.is_none() {
            return Err(Error::invalid_argument("seek needs a target time"));
        }

        use SessionState::{Active, FastForward, FastRewind, Paused, Seeking};
        let state = cell.state();
        let (allowed, target): (&[SessionState], SessionState) = match action {
            ReplayAction::Pause => (&[Active], Paused),
            ReplayAction::Resume => (&[Paused], Active),
            ReplayAction::Fast => (&[Active, FastForward], FastForward),
            ReplayAction::Slow | ReplayAction::FrameSkip => (&[Active], Active),
            ReplayAction::Seek => (&[Active], Seeking),
            ReplayAction::Normal => (&[Active, Paused, FastForward, FastRewind], Active),
            ReplayAction::Stop => return self.close(handle).await,
        };
        if !allowed.contains(&state) {
            return Err(Error::invalid_state(state, "control replay"));
        }
        let endpoint = slot
            .endpoint()
            .ok_or(Error::Transport(TransportFault::EndpointClosed))?;

        // Seeking is entered before the device answers and left on the ack.
        if action == ReplayAction::Seek {
            inner.set_state(&cell, Seeking).await?;
        }

        let channel = cell.with(|s| s.channel);
        let envelope = inner
            .command(&slot, replay::action(action), channel)
            .with_json(&ReplayControl { action, value })?;
        let result = inner.exchange(&endpoint, envelope, owner_of(&cell)).await;

        if action == ReplayAction::Seek {
            let cancelled = matches!(&result, Err(e) if e.is_cancelled());
            if !cancelled && cell.state() == Seeking {
                if let Err(e) = inner.set_state(&cell, Active).await {
                    debug!(session_id = %handle.id, error = %e, "seek finished after state change");
                }
            }
            return result.map(|_| ());
        }
        result?;
        if cell.state() != target {
            inner.set_state(&cell, target).await?;
        }
        debug!(session_id = %handle.id, ?action, ?value, "replay control applied");
        Ok(())
    }

    pub async fn pause(&self, handle: &SessionHandle) -> Result<()> {
        self.replay_control(handle, ReplayAction::Pause, None).await
    }

    pub async fn resume(&self, handle: &SessionHandle) -> Result<()> {
        self.replay_control(handle, ReplayAction::Resume, None).await
    }

    /// Jump to `time`, unix seconds
    pub async fn seek(&self, handle: &SessionHandle, time: u64) -> Result<()> {
        self.replay_control(handle, ReplayAction::Seek, Some(time)).await
    }

    pub async fn fast(&self, handle: &SessionHandle, speed: u64) -> Result<()> {
        self.replay_control(handle, ReplayAction::Fast, Some(speed)).await
    }

    pub async fn slow(&self, handle: &SessionHandle, speed: u64) -> Result<()> {
        self.replay_control(handle, ReplayAction::Slow, Some(speed)).await
    }

    pub async fn frame_skip(&self, handle: &SessionHandle) -> Result<()> {
        self.replay_control(handle, ReplayAction::FrameSkip, None).await
    }

    pub async fn normal(&self, handle: &SessionHandle) -> Result<()> {
        self.replay_control(handle, ReplayAction::Normal, None).await
    }

    /// Packetize one audio chunk and send it to the device
    pub async fn send_talk_audio(&self, handle: &SessionHandle, chunk: AudioChunk) -> Result<()> {
        let inner = &self.inner;
        let (slot, cell) = inner.session_cell(handle)?;
        if cell.kind() != SessionKind::Talk {
            return Err(Error::invalid_argument(format!("cannot send audio on a {} session", cell.kind())));
        }
        let state = cell.state();
        if state != SessionState::Active {
            return Err(Error::invalid_state(state, "send talk audio"));
        }
        let endpoint = slot
            .endpoint()
            .ok_or(Error::Transport(TransportFault::EndpointClosed))?;

        let packets = cell
            .with(|s| {
                s.packetizer
                    .as_mut()
                    .map(|p| p.packetize(chunk.payload, chunk.timestamp, false))
            })
            .ok_or_else(|| Error::invalid_state(state, "send talk audio"))??;
        for packet in packets {
            endpoint.send_body(PacketType::Media, packet.serialize()).await?;
        }
        Ok(())
    }

    /// Push a file to the device in chunks.
    ///
    /// The session must be an `Active` upload whose request announced
    /// exactly `data.len()` bytes. Progress is reported per chunk, then
    /// `UploadOk` or `UploadFailed`.
    pub async fn upload(&self, handle: &SessionHandle, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        let (slot, cell) = inner.session_cell(handle)?;
        if cell.kind() != SessionKind::Upload {
            return Err(Error::invalid_argument(format!("cannot upload on a {} session", cell.kind())));
        }
        let state = cell.state();
        if state != SessionState::Active {
            return Err(Error::invalid_state(state, "upload"));
        }
        let total = cell
            .with(|s| s.upload.as_ref().map(|u| u.request.total_size))
            .ok_or_else(|| Error::invalid_argument("upload session without a request"))?;
        if data.len() as u64 != total {
            return Err(Error::invalid_argument(format!(
                "upload announced {} bytes, got {}",
                total,
                data.len()
            )));
        }
        let endpoint = slot
            .endpoint()
            .ok_or(Error::Transport(TransportFault::EndpointClosed))?;
        let chunk_size = inner.config().session.upload_chunk_size.max(1);
        let channel = cell.with(|s| s.channel);

        let mut sent = 0u64;
        let result = async {
            for piece in data.chunks(chunk_size) {
                let chunk = UploadChunk {
                    offset: sent,
                    data: piece.to_vec(),
                };
                let envelope = inner
                    .command(&slot, system::UPLOAD_CHUNK, channel)
                    .with_json(&chunk)?;
                inner.exchange(&endpoint, envelope, owner_of(&cell)).await?;
                sent += piece.len() as u64;
                cell.with(|s| {
                    if let Some(upload) = s.upload.as_mut() {
                        upload.sent = sent;
                    }
                });
                inner
                    .sink()
                    .emit(Event::UploadProgress {
                        handle: cell.handle(),
                        progress: UploadProgress { sent, total },
                    })
                    .await;
            }
            inner
                .exchange(&endpoint, inner.command(&slot, system::UPLOAD_FINISH, channel), owner_of(&cell))
                .await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(session_id = %handle.id, bytes = sent, "upload finished");
                inner.sink().emit(Event::UploadOk { handle: cell.handle() }).await;
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %handle.id, sent, error = %e, "upload failed");
                inner
                    .sink()
                    .emit(Event::UploadFailed {
                        handle: cell.handle(),
                        reason: e.to_string(),
                    })
                    .await;
                if !e.is_cancelled() {
                    inner.fail_session(&cell, e.clone()).await;
                }
                Err(e)
            }
        }
    }

    /// Bytes received so far by a download session
    pub fn download_progress(&self, handle: &SessionHandle) -> Result<DownloadProgress> {
        let (_, cell) = self.inner.session_cell(handle)?;
        cell.with(|s| {
            s.download.as_ref().map(|d| DownloadProgress {
                received: d.offset,
                total: d.total,
            })
        })
        .ok_or_else(|| Error::invalid_argument(format!("{} is not a download", handle.id)))
    }

    /// Forward or suppress the device's alarm notifications.
    ///
    /// Tells the device too when an endpoint is open.
    pub async fn set_auto_receive_alarm(&self, device_id: &str, enabled: bool) -> Result<()> {
        let inner = &self.inner;
        let slot = inner.slot(device_id);
        slot.set_auto_receive_alarm(enabled);
        info!(device_id, enabled, "alarm forwarding changed");

        let Some(endpoint) = slot.endpoint().filter(|e| !e.is_closed()) else {
            return Ok(());
        };
        let envelope = inner
            .command(&slot, system::AUTO_ALARM, None)
            .with_json(&AlarmSubscription { enabled })?;
        inner.exchange(&endpoint, envelope, None).await?;
        Ok(())
    }

    /// Hole-punch budget for endpoints opened from now on
    pub fn set_p2p_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.config.write().transport.set_p2p_timeout(timeout)?;
        info!(timeout_ms = timeout.as_millis() as u64, "P2P timeout changed");
        Ok(())
    }

    /// Open sub-stream watches through the relay
    pub fn force_substream_by_relay(&self, enabled: bool) {
        self.inner.config.write().transport.force_substream_by_relay = enabled;
        info!(enabled, "sub-stream relay forcing changed");
    }

    /// Install or replace the event handler
    pub fn set_event_handler(&self, handler: Option<std::sync::Arc<dyn crate::events::EventHandler>>) {
        self.inner.sink().set_handler(handler);
    }
}
