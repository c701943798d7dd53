use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::{FrameIndex, PacketSequence, Result};

/// Size of the stream packet header in bytes
pub const STREAM_HEADER_SIZE: usize = 20;

/// Position of a packet within its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PackRole {
    Middle = 0x00,
    First = 0x01,
    Last = 0x10,
    /// The frame fits in this single packet
    Only = 0x11,
}

impl PackRole {
    pub fn starts_frame(self) -> bool {
        matches!(self, PackRole::First | PackRole::Only)
    }

    pub fn ends_frame(self) -> bool {
        matches!(self, PackRole::Last | PackRole::Only)
    }
}

impl TryFrom<u8> for PackRole {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PackRole::Middle),
            0x01 => Ok(PackRole::First),
            0x10 => Ok(PackRole::Last),
            0x11 => Ok(PackRole::Only),
            other => Err(Error::InvalidPacket(format!("unknown pack type 0x{:02x}", other))),
        }
    }
}

/// Intra or predicted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Key,
    Delta,
}

impl FrameType {
    fn from_wire(value: u8) -> Self {
        if value == 1 { FrameType::Key } else { FrameType::Delta }
    }

    fn to_wire(self) -> u8 {
        match self {
            FrameType::Key => 1,
            FrameType::Delta => 0,
        }
    }
}

/// Kind of stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamType {
    Video = 0,
    Audio = 1,
    SendReport = 2,
    RecvReport = 3,
    HolePunch = 4,
}

impl StreamType {
    /// Video and audio carry media; the rest are control traffic on the media path
    pub fn is_media(self) -> bool {
        matches!(self, StreamType::Video | StreamType::Audio)
    }
}

impl TryFrom<u8> for StreamType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StreamType::Video),
            1 => Ok(StreamType::Audio),
            2 => Ok(StreamType::SendReport),
            3 => Ok(StreamType::RecvReport),
            4 => Ok(StreamType::HolePunch),
            other => Err(Error::InvalidPacket(format!("unknown stream type {}", other))),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Video => write!(f, "video"),
            StreamType::Audio => write!(f, "audio"),
            StreamType::SendReport => write!(f, "send-report"),
            StreamType::RecvReport => write!(f, "recv-report"),
            StreamType::HolePunch => write!(f, "hole-punch"),
        }
    }
}

/// Header in front of every media packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPacketHeader {
    /// Capture time of the frame, milliseconds
    pub frame_timestamp: u32,
    /// Timestamp of the key frame this frame depends on
    pub keyframe_timestamp: u32,
    /// Per-stream packet counter, wraps at 65536
    pub sequence: PacketSequence,
    pub payload_size: u16,
    pub role: PackRole,
    pub frame_type: FrameType,
    pub stream_type: StreamType,
    /// 0 main stream, 1 sub stream
    pub stream_index: u8,
    pub frame_index: FrameIndex,
}

impl StreamPacketHeader {
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < STREAM_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: STREAM_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let frame_timestamp = buf.get_u32();
        let keyframe_timestamp = buf.get_u32();
        let sequence = buf.get_u16();
        let payload_size = buf.get_u16();
        let role = PackRole::try_from(buf.get_u8())?;
        let frame_type = FrameType::from_wire(buf.get_u8());
        let stream_type = StreamType::try_from(buf.get_u8())?;
        let stream_index = buf.get_u8();
        let frame_index = buf.get_u32();

        Ok(Self {
            frame_timestamp,
            keyframe_timestamp,
            sequence,
            payload_size,
            role,
            frame_type,
            stream_type,
            stream_index,
            frame_index,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(STREAM_HEADER_SIZE);
        buf.put_u32(self.frame_timestamp);
        buf.put_u32(self.keyframe_timestamp);
        buf.put_u16(self.sequence);
        buf.put_u16(self.payload_size);
        buf.put_u8(self.role as u8);
        buf.put_u8(self.frame_type.to_wire());
        buf.put_u8(self.stream_type as u8);
        buf.put_u8(self.stream_index);
        buf.put_u32(self.frame_index);
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// A header and the payload slice it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub header: StreamPacketHeader,
    pub payload: Bytes,
}

impl StreamPacket {
    /// Build a packet, filling in the payload size
    pub fn new(mut header: StreamPacketHeader, payload: Bytes) -> Result<Self> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge(payload.len()));
        }
        header.payload_size = payload.len() as u16;
        Ok(Self { header, payload })
    }

    pub fn parse(mut data: Bytes) -> Result<Self> {
        let header = StreamPacketHeader::parse(&mut data)?;
        let declared = header.payload_size as usize;
        if data.len() < declared {
            return Err(Error::PayloadLength {
                declared,
                actual: data.len(),
            });
        }
        Ok(Self {
            header,
            payload: data.slice(0..declared),
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STREAM_HEADER_SIZE + self.payload.len());
        self.header.serialize(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn size(&self) -> usize {
        STREAM_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamPacketHeader {
        StreamPacketHeader {
            frame_timestamp: 0x0102_0304,
            keyframe_timestamp: 0x0102_0000,
            sequence: 0xfffe,
            payload_size: 0,
            role: PackRole::First,
            frame_type: FrameType::Key,
            stream_type: StreamType::Video,
            stream_index: 1,
            frame_index: 7,
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = StreamPacket::new(header(), Bytes::from_static(b"xy")).unwrap();
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), STREAM_HEADER_SIZE + 2);
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..10], &[0xff, 0xfe]);
        assert_eq!(&bytes[10..12], &[0x00, 0x02]);
        assert_eq!(bytes[12], 0x01);
        assert_eq!(bytes[13], 1);
        assert_eq!(bytes[14], 0);
        assert_eq!(bytes[15], 1);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 7]);
        assert_eq!(StreamPacket::parse(bytes).unwrap(), packet);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let mut bytes = BytesMut::from(StreamPacket::new(header(), Bytes::new()).unwrap().serialize().as_ref());
        bytes[12] = 0x05;
        assert!(matches!(
            StreamPacket::parse(bytes.freeze()),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_short_payload_rejected() {
        let bytes = StreamPacket::new(header(), Bytes::from_static(b"abcd")).unwrap().serialize();
        let cut = bytes.slice(0..bytes.len() - 1);
        assert_eq!(
            StreamPacket::parse(cut),
            Err(Error::PayloadLength {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_role_flags() {
        assert!(PackRole::Only.starts_frame() && PackRole::Only.ends_frame());
        assert!(PackRole::First.starts_frame() && !PackRole::First.ends_frame());
        assert!(!PackRole::Middle.starts_frame() && !PackRole::Middle.ends_frame());
    }
}
