//! Typed request and response bodies carried as JSON in control envelopes.

use std::fmt;
use std::ops::BitOr;

use camlink_transport_core::MAX_FRAME_BODY;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Media transport the device assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransProtocol {
    #[default]
    Udp,
    Tcp,
}

/// Unicast or multicast delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CastMode {
    #[default]
    Unicast,
    Multicast,
}

/// Media type bits in a watch response
pub mod media_type {
    pub const VIDEO: u32 = 0x0001;
    pub const AUDIO: u32 = 0x0100;
    pub const AUDIO_VIDEO: u32 = VIDEO | AUDIO;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VideoParams {
    pub stream_index: u8,
    pub encoder: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Key frame interval
    pub intraframerate: u32,
    pub bitrate: u32,
    /// Decoder configuration to prepend to the first key frame
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AudioParams {
    pub stream_index: u8,
    pub encoder: String,
    pub samplerate: u32,
    /// 8 or 16
    pub sample_bits: u8,
    pub channels: u8,
    pub bitrate: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub stream_index: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u16>,
}

/// Answer to a live-view request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WatchResponse {
    pub result: i32,
    pub trans_protocol: TransProtocol,
    pub fsm: CastMode,
    pub multicast_ip: Option<String>,
    pub multicast_port: u16,
    /// See [`media_type`]
    pub media_type: u32,
    pub send_port: u16,
    pub recv_port: u16,
    pub server_ip: Option<String>,
    pub server_instance: u32,
    pub enable_change_stream: bool,
    pub video: VideoParams,
    pub audio: AudioParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TalkResponse {
    pub result: i32,
    pub trans_protocol: TransProtocol,
    pub server_ip: Option<String>,
    pub send_port: u16,
    pub recv_port: u16,
    pub server_instance: u32,
    pub audio: AudioParams,
}

/// Recorder replay actions with their device codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ReplayAction {
    Resume = 1,
    Pause = 2,
    Stop = 3,
    Fast = 4,
    Slow = 5,
    Seek = 6,
    FrameSkip = 7,
    Normal = 8,
}

impl From<ReplayAction> for u8 {
    fn from(action: ReplayAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for ReplayAction {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => ReplayAction::Resume,
            2 => ReplayAction::Pause,
            3 => ReplayAction::Stop,
            4 => ReplayAction::Fast,
            5 => ReplayAction::Slow,
            6 => ReplayAction::Seek,
            7 => ReplayAction::FrameSkip,
            8 => ReplayAction::Normal,
            other => return Err(Error::invalid_argument(format!("replay action {}", other))),
        })
    }
}

/// Which recording to replay or download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplayRequest {
    pub channel: u16,
    pub file: Option<String>,
    /// Unix seconds
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplayResponse {
    pub result: i32,
    pub file: Option<String>,
    pub video_secs: u32,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayControl {
    pub action: ReplayAction,
    /// Seek target in unix seconds, or speed multiplier for fast/slow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

/// Recording trigger flags, combinable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordTypeFlags(pub u32);

impl RecordTypeFlags {
    pub const SCHEDULE: Self = Self(0x1);
    pub const MANUAL: Self = Self(0x2);
    pub const ALARM: Self = Self(0x4);
    pub const MOTION: Self = Self(0x8);
    pub const REGIONAL: Self = Self(0x10);
    pub const CROSS_BORDER: Self = Self(0x20);
    pub const LICENSE_PLATE: Self = Self(0x40);
    pub const FACE: Self = Self(0x80);
    pub const HUMAN: Self = Self(0x100);
    pub const VEHICLE: Self = Self(0x200);
    pub const ANIMAL: Self = Self(0x400);
    pub const TUMBLE: Self = Self(0x800);
    pub const PARABOLA: Self = Self(0x1000);
    pub const ALL: Self = Self(0x1fff);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RecordTypeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSearch {
    pub channel: u16,
    /// `YYYYMMDD`
    pub day: String,
    pub record_types: RecordTypeFlags,
}

/// One recorded span on a recorder channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSegment {
    pub channel: u16,
    pub start_time: u64,
    pub end_time: u64,
    pub record_type: RecordTypeFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecordSearchResponse {
    pub segments: Vec<RecordSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthSearch {
    pub channel: u16,
    /// `YYYYMM`
    pub month: String,
    pub record_types: RecordTypeFlags,
}

/// Days of the month (1-based) that have recordings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonthSearchResponse {
    pub days: Vec<u8>,
}

/// Pan/tilt/zoom commands with their device codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PtzCommand {
    LightOn = 2,
    WiperOn = 3,
    FanOn = 4,
    HeaterOn = 5,
    AuxOn1 = 6,
    AuxOn2 = 7,
    ZoomIn = 11,
    ZoomOut = 12,
    FocusNear = 13,
    FocusFar = 14,
    IrisOpen = 15,
    IrisClose = 16,
    TiltUp = 17,
    TiltDown = 18,
    PanLeft = 19,
    PanRight = 20,
    UpLeft = 21,
    UpRight = 22,
    DownLeft = 23,
    DownRight = 24,
    PanAuto = 25,
    Stop = 26,
}

impl PtzCommand {
    const ALL: [PtzCommand; 22] = [
        PtzCommand::LightOn,
        PtzCommand::WiperOn,
        PtzCommand::FanOn,
        PtzCommand::HeaterOn,
        PtzCommand::AuxOn1,
        PtzCommand::AuxOn2,
        PtzCommand::ZoomIn,
        PtzCommand::ZoomOut,
        PtzCommand::FocusNear,
        PtzCommand::FocusFar,
        PtzCommand::IrisOpen,
        PtzCommand::IrisClose,
        PtzCommand::TiltUp,
        PtzCommand::TiltDown,
        PtzCommand::PanLeft,
        PtzCommand::PanRight,
        PtzCommand::UpLeft,
        PtzCommand::UpRight,
        PtzCommand::DownLeft,
        PtzCommand::DownRight,
        PtzCommand::PanAuto,
        PtzCommand::Stop,
    ];
}

impl From<PtzCommand> for u8 {
    fn from(cmd: PtzCommand) -> u8 {
        cmd as u8
    }
}

impl TryFrom<u8> for PtzCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        PtzCommand::ALL
            .into_iter()
            .find(|c| *c as u8 == value)
            .ok_or_else(|| Error::invalid_argument(format!("PTZ command {}", value)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzRequest {
    pub channel: u16,
    pub command: PtzCommand,
    pub pan_speed: u8,
    pub tilt_speed: u8,
}

/// Kinds of file a device accepts for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum UploadFileType {
    Config = 0,
    Firmware = 1,
    Audio = 2,
    CompressedConfig = 3,
    Logo = 4,
    AiAlgorithm = 8,
    BleTest = 9,
}

impl From<UploadFileType> for u8 {
    fn from(t: UploadFileType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for UploadFileType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => UploadFileType::Config,
            1 => UploadFileType::Firmware,
            2 => UploadFileType::Audio,
            3 => UploadFileType::CompressedConfig,
            4 => UploadFileType::Logo,
            8 => UploadFileType::AiAlgorithm,
            9 => UploadFileType::BleTest,
            other => return Err(Error::invalid_argument(format!("upload file type {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub file_type: UploadFileType,
    pub file_name: String,
    pub total_size: u64,
}

/// Frame room kept for the envelope header, a device id of up to 255 bytes
/// and the JSON around an upload chunk
const UPLOAD_ENVELOPE_OVERHEAD: usize = 512;

/// Largest upload chunk whose base64 text still fits in one frame
pub const MAX_UPLOAD_CHUNK_SIZE: usize = (MAX_FRAME_BODY - UPLOAD_ENVELOPE_OVERHEAD) / 4 * 3;

/// One piece of an upload. `data` travels as base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunk {
    pub offset: u64,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

mod base64_data {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.sent.min(self.total) * 100) / self.total) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DownloadRequest {
    pub channel: u16,
    pub file: Option<String>,
    pub start_time: u64,
    pub end_time: u64,
    /// Byte offset to resume from
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DownloadProgress {
    pub received: u64,
    pub total: u64,
}

/// Alarm raised or cleared by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlarmInfo {
    pub timestamp: u64,
    pub alarm_type: u32,
    pub raised: bool,
    pub level: u32,
    pub description: String,
    pub channel: Option<u16>,
    /// -1 camera, 0 recorder itself, 1 recorder forwarding a camera
    pub source: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EventInfo {
    pub timestamp: u64,
    pub event_type: u32,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelNotice {
    pub channel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelect {
    pub stream_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSubscription {
    pub enabled: bool,
}

impl fmt::Display for PtzCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}
