//! Control envelope codec.
//!
//! Layout, big-endian:
//!
//! ```text
//! family u16 | code u16 | kind u8 | result i32 | channel i16 | transparent i16 |
//! correlation [u8; 16] | device_id_len u8 | device_id | payload_len u32 | payload
//! ```
//!
//! `channel` and `transparent` use -1 for "none". Payloads are JSON.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;
use crate::Result;

/// Fixed part of the envelope before the device id
const FIXED_HEADER_SIZE: usize = 2 + 2 + 1 + 4 + 2 + 2 + 16 + 1;

/// Upper bound on a single control payload
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Command families understood by the devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum MessageFamily {
    ConfigGet = 1,
    ConfigSet = 2,
    SystemControl = 3,
    HwConfig = 4,
    LiveStream = 5,
    MediaData = 6,
    IotCamera = 100,
    NvrReplay = 200,
}

impl MessageFamily {
    pub const ALL: [MessageFamily; 8] = [
        MessageFamily::ConfigGet,
        MessageFamily::ConfigSet,
        MessageFamily::SystemControl,
        MessageFamily::HwConfig,
        MessageFamily::LiveStream,
        MessageFamily::MediaData,
        MessageFamily::IotCamera,
        MessageFamily::NvrReplay,
    ];

    /// Name used in configuration files
    pub fn name(self) -> &'static str {
        match self {
            MessageFamily::ConfigGet => "config-get",
            MessageFamily::ConfigSet => "config-set",
            MessageFamily::SystemControl => "system-control",
            MessageFamily::HwConfig => "hw-config",
            MessageFamily::LiveStream => "live-stream",
            MessageFamily::MediaData => "media-data",
            MessageFamily::IotCamera => "iot-camera",
            MessageFamily::NvrReplay => "nvr-replay",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl TryFrom<u16> for MessageFamily {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| *f as u16 == value)
            .ok_or_else(|| Error::MalformedEnvelope(format!("unknown message family {}", value)))
    }
}

impl fmt::Display for MessageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A command within its family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandCode {
    pub family: MessageFamily,
    pub code: u16,
}

impl CommandCode {
    pub const fn new(family: MessageFamily, code: u16) -> Self {
        Self { family, code }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.family, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Request = 0,
    Response = 1,
    /// Unsolicited device notification
    Notify = 2,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EnvelopeKind::Request),
            1 => Ok(EnvelopeKind::Response),
            2 => Ok(EnvelopeKind::Notify),
            other => Err(Error::MalformedEnvelope(format!("unknown envelope kind {}", other))),
        }
    }
}

/// How a command reaches its target.
///
/// A recorder forwards `Transparent` commands unchanged to the camera on the
/// given channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Route {
    #[default]
    Direct,
    Transparent(u16),
}

impl Route {
    pub fn transparent_channel(self) -> Option<u16> {
        match self {
            Route::Direct => None,
            Route::Transparent(channel) => Some(channel),
        }
    }
}

/// One control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub code: CommandCode,
    pub kind: EnvelopeKind,
    /// Device result code on responses, 0 on requests
    pub result: i32,
    /// Device channel the command addresses
    pub channel: Option<u16>,
    pub route: Route,
    pub correlation: Uuid,
    pub device_id: String,
    pub payload: Bytes,
}

fn put_optional_channel(buf: &mut BytesMut, channel: Option<u16>) -> Result<()> {
    match channel {
        None => buf.put_i16(-1),
        Some(c) => {
            let c = i16::try_from(c)
                .map_err(|_| Error::MalformedEnvelope(format!("channel {} out of range", c)))?;
            buf.put_i16(c);
        }
    }
    Ok(())
}

fn optional_channel(value: i16) -> Option<u16> {
    if value < 0 { None } else { Some(value as u16) }
}

impl CommandEnvelope {
    /// A request with a fresh correlation id and an empty payload
    pub fn request(code: CommandCode, device_id: impl Into<String>) -> Self {
        Self {
            code,
            kind: EnvelopeKind::Request,
            result: 0,
            channel: None,
            route: Route::Direct,
            correlation: Uuid::new_v4(),
            device_id: device_id.into(),
            payload: Bytes::new(),
        }
    }

    pub fn notify(code: CommandCode, device_id: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Notify,
            ..Self::request(code, device_id)
        }
    }

    /// The response a device would send to this request
    pub fn response(&self, result: i32, payload: Bytes) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            result,
            payload,
            ..self.clone()
        }
    }

    pub fn with_channel(mut self, channel: u16) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize `body` as the JSON payload
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.payload = Bytes::from(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Parse the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn is_success(&self) -> bool {
        self.result == 0
    }

    pub fn encode(&self) -> Result<Bytes> {
        let id = self.device_id.as_bytes();
        if id.len() > u8::MAX as usize {
            return Err(Error::MalformedEnvelope(format!(
                "device id of {} bytes does not fit",
                id.len()
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::MalformedEnvelope(format!(
                "payload of {} bytes exceeds limit",
                self.payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(FIXED_HEADER_SIZE + id.len() + 4 + self.payload.len());
        buf.put_u16(self.code.family as u16);
        buf.put_u16(self.code.code);
        buf.put_u8(self.kind as u8);
        buf.put_i32(self.result);
        put_optional_channel(&mut buf, self.channel)?;
        put_optional_channel(&mut buf, self.route.transparent_channel())?;
        buf.put_slice(self.correlation.as_bytes());
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.remaining() < FIXED_HEADER_SIZE {
            return Err(Error::MalformedEnvelope(format!(
                "need {} bytes, have {}",
                FIXED_HEADER_SIZE,
                data.remaining()
            )));
        }

        let family = MessageFamily::try_from(data.get_u16())?;
        let code = data.get_u16();
        let kind = EnvelopeKind::try_from(data.get_u8())?;
        let result = data.get_i32();
        let channel = optional_channel(data.get_i16());
        let route = match optional_channel(data.get_i16()) {
            Some(c) => Route::Transparent(c),
            None => Route::Direct,
        };
        let mut uuid = [0u8; 16];
        data.copy_to_slice(&mut uuid);
        let id_len = data.get_u8() as usize;

        if data.remaining() < id_len + 4 {
            return Err(Error::MalformedEnvelope("truncated device id".into()));
        }
        let device_id = String::from_utf8(data.split_to(id_len).to_vec())
            .map_err(|_| Error::MalformedEnvelope("device id is not UTF-8".into()))?;
        let payload_len = data.get_u32() as usize;
        if data.remaining() < payload_len {
            return Err(Error::MalformedEnvelope(format!(
                "payload declares {} bytes, {} present",
                payload_len,
                data.remaining()
            )));
        }

        Ok(Self {
            code: CommandCode::new(family, code),
            kind,
            result,
            channel,
            route,
            correlation: Uuid::from_bytes(uuid),
            device_id,
            payload: data.split_to(payload_len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Body {
        stream: u8,
    }

    #[test]
    fn test_envelope_layout() {
        let env = CommandEnvelope::request(CommandCode::new(MessageFamily::LiveStream, 42), "D1")
            .with_channel(3)
            .with_json(&Body { stream: 1 })
            .unwrap();
        let bytes = env.encode().unwrap();

        assert_eq!(&bytes[0..2], &[0, 5]);
        assert_eq!(&bytes[2..4], &[0, 42]);
        assert_eq!(bytes[4], 0);
        assert_eq!(&bytes[9..11], &[0, 3]);
        assert_eq!(&bytes[11..13], &[0xff, 0xff]);
        assert_eq!(&bytes[13..29], env.correlation.as_bytes());
        assert_eq!(bytes[29], 2);
        assert_eq!(&bytes[30..32], b"D1");

        let decoded = CommandEnvelope::decode(bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.json::<Body>().unwrap(), Body { stream: 1 });
    }

    #[test]
    fn test_transparent_route_survives() {
        let env = CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigGet, 7), "NVR")
            .with_route(Route::Transparent(4));
        let decoded = CommandEnvelope::decode(env.encode().unwrap()).unwrap();
        assert_eq!(decoded.route, Route::Transparent(4));
        assert_eq!(decoded.channel, None);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let env = CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigSet, 1), "D1")
            .with_payload(Bytes::from_static(b"{}"));
        let bytes = env.encode().unwrap();
        let cut = bytes.slice(0..bytes.len() - 1);
        assert!(matches!(
            CommandEnvelope::decode(cut),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_unknown_family_rejected() {
        let mut raw = BytesMut::from(
            CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigGet, 1), "D1")
                .encode()
                .unwrap()
                .as_ref(),
        );
        raw[1] = 9;
        assert!(CommandEnvelope::decode(raw.freeze()).is_err());
    }

    #[test]
    fn test_family_names() {
        for family in MessageFamily::ALL {
            assert_eq!(MessageFamily::from_name(family.name()), Some(family));
        }
        assert_eq!(MessageFamily::from_name("bogus"), None);
    }
}
