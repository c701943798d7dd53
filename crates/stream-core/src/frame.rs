use bytes::Bytes;

use crate::error::Error;
use crate::packet::StreamType;
use crate::{FrameIndex, Result};

/// A complete video or audio frame rebuilt from its packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub stream_type: StreamType,
    pub stream_index: u8,
    pub frame_index: FrameIndex,
    pub key_frame: bool,
    /// Capture time in milliseconds
    pub timestamp: u32,
    pub keyframe_timestamp: u32,
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Copy the payload into a caller buffer. Never truncates.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.payload.len() {
            return Err(Error::BufferTooSmall {
                required: self.payload.len(),
                available: buf.len(),
            });
        }
        buf[..self.payload.len()].copy_from_slice(&self.payload);
        Ok(self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_into_checks_capacity() {
        let frame = MediaFrame {
            stream_type: StreamType::Video,
            stream_index: 0,
            frame_index: 1,
            key_frame: true,
            timestamp: 0,
            keyframe_timestamp: 0,
            payload: Bytes::from_static(b"abcdef"),
        };
        let mut small = [0u8; 4];
        assert_eq!(
            frame.read_into(&mut small),
            Err(Error::BufferTooSmall {
                required: 6,
                available: 4
            })
        );
        let mut big = [0u8; 8];
        assert_eq!(frame.read_into(&mut big), Ok(6));
        assert_eq!(&big[..6], b"abcdef");
    }
}
