//! Transport framing.
//!
//! Every unit exchanged with a device, on any link, starts with the same
//! 12-byte header. Directly after a relay connection is established the
//! client sends this header alone, with packet type [`PacketType::Notification`]
//! and a zero data length, so the broker can bind the socket to the server
//! session instance before it forwards any media.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::Result;

/// Magic constant opening every frame header
pub const FRAME_MAGIC: u32 = 0x6970_7673;

/// Size of the frame header in bytes
pub const FRAME_HEADER_SIZE: usize = 12;

/// Largest body a single frame can carry
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Who produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataSource {
    Client = 0,
    Device = 1,
    Server = 2,
}

impl TryFrom<u8> for DataSource {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DataSource::Client),
            1 => Ok(DataSource::Device),
            2 => Ok(DataSource::Server),
            other => Err(Error::MalformedFrame(format!("unknown data source {}", other))),
        }
    }
}

/// What a frame body contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Relay session binding, always empty
    Notification = 0,
    /// Stream packet header followed by media payload
    Media = 1,
    /// Control envelope
    Control = 2,
    /// NAT traversal probe or probe answer
    HolePunch = 3,
    /// Keepalive
    Heartbeat = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Notification),
            1 => Ok(PacketType::Media),
            2 => Ok(PacketType::Control),
            3 => Ok(PacketType::HolePunch),
            4 => Ok(PacketType::Heartbeat),
            other => Err(Error::MalformedFrame(format!("unknown packet type {}", other))),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Notification => write!(f, "notification"),
            PacketType::Media => write!(f, "media"),
            PacketType::Control => write!(f, "control"),
            PacketType::HolePunch => write!(f, "hole-punch"),
            PacketType::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// The fixed header in front of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Session instance assigned by the relay broker, zero on direct paths
    pub server_instance: u32,
    pub data_source: DataSource,
    pub packet_type: PacketType,
    /// Length of the body that follows the header
    pub data_length: u16,
}

impl FrameHeader {
    /// The header a client sends right after a relay connect
    pub fn notification(server_instance: u32) -> Self {
        Self {
            server_instance,
            data_source: DataSource::Client,
            packet_type: PacketType::Notification,
            data_length: 0,
        }
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: FRAME_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let magic = buf.get_u32();
        if magic != FRAME_MAGIC {
            return Err(Error::MalformedFrame(format!("bad magic 0x{:08x}", magic)));
        }

        let server_instance = buf.get_u32();
        let data_source = DataSource::try_from(buf.get_u8())?;
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let data_length = buf.get_u16();

        Ok(Self {
            server_instance,
            data_source,
            packet_type,
            data_length,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE);
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(self.server_instance);
        buf.put_u8(self.data_source as u8);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.data_length);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        self.serialize(&mut buf);
        buf.freeze()
    }
}

/// A header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

impl Frame {
    /// Build a client frame. The server instance is stamped by the endpoint on send.
    pub fn new(packet_type: PacketType, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            header: FrameHeader {
                server_instance: 0,
                data_source: DataSource::Client,
                packet_type,
                data_length: body.len().min(MAX_FRAME_BODY) as u16,
            },
            body,
        }
    }

    /// Build a frame as the device side would send it
    pub fn from_device(packet_type: PacketType, body: impl Into<Bytes>) -> Self {
        let mut frame = Self::new(packet_type, body);
        frame.header.data_source = DataSource::Device;
        frame
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.body.len() > MAX_FRAME_BODY {
            return Err(Error::FrameTooLarge(self.body.len()));
        }
        let mut header = self.header;
        header.data_length = self.body.len() as u16;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.body.len());
        header.serialize(&mut buf);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode one frame from a complete unit. Trailing bytes past the declared
    /// length are ignored; a short body is an error.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let header = FrameHeader::parse(&mut data)?;
        let len = header.data_length as usize;
        if data.len() < len {
            return Err(Error::MalformedFrame(format!(
                "declared {} body bytes but only {} present",
                len,
                data.len()
            )));
        }
        Ok(Self {
            header,
            body: data.slice(0..len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_header_layout() {
        let bytes = FrameHeader::notification(0x0102_0304).to_bytes();
        assert_eq!(
            bytes.as_ref(),
            &[0x69, 0x70, 0x76, 0x73, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_frame_encode_decode() {
        let mut frame = Frame::new(PacketType::Control, Bytes::from_static(b"hello"));
        frame.header.server_instance = 9;
        let decoded = Frame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.server_instance, 9);
        assert_eq!(decoded.packet_type(), PacketType::Control);
        assert_eq!(decoded.body, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_short_header_reports_sizes() {
        let err = Frame::decode(Bytes::from_static(&[0x69, 0x70])).unwrap_err();
        assert_eq!(
            err,
            Error::BufferTooSmall {
                required: FRAME_HEADER_SIZE,
                available: 2
            }
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xdead_beef);
        buf.put_slice(&[0; 8]);
        assert!(matches!(
            Frame::decode(buf.freeze()),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let frame = Frame::new(PacketType::Media, Bytes::from_static(b"abcdef"));
        let encoded = frame.encode().unwrap();
        let truncated = encoded.slice(0..encoded.len() - 2);
        assert!(matches!(
            Frame::decode(truncated),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversize_body_rejected() {
        let frame = Frame::new(PacketType::Media, vec![0u8; MAX_FRAME_BODY + 1]);
        assert_eq!(frame.encode(), Err(Error::FrameTooLarge(MAX_FRAME_BODY + 1)));
    }
}
