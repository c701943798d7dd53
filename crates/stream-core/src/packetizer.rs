use bytes::Bytes;

use crate::packet::{FrameType, PackRole, StreamPacket, StreamPacketHeader, StreamType};
use crate::{FrameIndex, PacketSequence, Result};

/// Default payload bytes per packet, leaving room for both headers in a
/// 1400-byte datagram
pub const DEFAULT_MAX_PAYLOAD: usize = 1_368;

/// Splits outgoing frames into stream packets with running sequence numbers
#[derive(Debug, Clone)]
pub struct Packetizer {
    stream_type: StreamType,
    stream_index: u8,
    max_payload: usize,
    next_sequence: PacketSequence,
    next_frame_index: FrameIndex,
    last_key_timestamp: u32,
}

impl Packetizer {
    pub fn new(stream_type: StreamType, stream_index: u8) -> Self {
        Self {
            stream_type,
            stream_index,
            max_payload: DEFAULT_MAX_PAYLOAD,
            next_sequence: 0,
            next_frame_index: 0,
            last_key_timestamp: 0,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1);
        self
    }

    /// Start numbering at `sequence`
    pub fn with_initial_sequence(mut self, sequence: PacketSequence) -> Self {
        self.next_sequence = sequence;
        self
    }

    pub fn next_frame_index(&self) -> FrameIndex {
        self.next_frame_index
    }

    /// Split one frame. An empty payload still yields a single `Only` packet.
    pub fn packetize(&mut self, payload: Bytes, timestamp: u32, key_frame: bool) -> Result<Vec<StreamPacket>> {
        if key_frame {
            self.last_key_timestamp = timestamp;
        }
        let frame_index = self.next_frame_index;
        self.next_frame_index = self.next_frame_index.wrapping_add(1);

        let chunks: Vec<Bytes> = if payload.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..payload.len())
                .step_by(self.max_payload)
                .map(|start| payload.slice(start..(start + self.max_payload).min(payload.len())))
                .collect()
        };

        let count = chunks.len();
        let mut packets = Vec::with_capacity(count);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let role = match (i == 0, i + 1 == count) {
                (true, true) => PackRole::Only,
                (true, false) => PackRole::First,
                (false, true) => PackRole::Last,
                (false, false) => PackRole::Middle,
            };
            let header = StreamPacketHeader {
                frame_timestamp: timestamp,
                keyframe_timestamp: self.last_key_timestamp,
                sequence: self.next_sequence,
                payload_size: 0,
                role,
                frame_type: if key_frame { FrameType::Key } else { FrameType::Delta },
                stream_type: self.stream_type,
                stream_index: self.stream_index,
                frame_index,
            };
            self.next_sequence = self.next_sequence.wrapping_add(1);
            packets.push(StreamPacket::new(header, chunk)?);
        }
        Ok(packets)
    }
}
