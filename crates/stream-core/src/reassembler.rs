//! Frame reassembly.
//!
//! Packets are grouped per stream (stream type and index) and then per frame
//! index. Within a frame, payload order comes from the extended packet
//! sequence, so arrival order does not matter. A frame is released once its
//! first and last packets and every sequence number in between are present.
//!
//! Once frame `N` of a stream is released, any still-pending group with a
//! lower index is dropped, and packets for frames `<= N` are stale. Video
//! delta frames are only released when the key frame they reference was seen
//! on that stream; otherwise they are discarded and counted, which keeps a
//! decoder from being fed frames it cannot use.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::frame::MediaFrame;
use crate::packet::{StreamPacket, StreamPacketHeader, StreamType};
use crate::sequence::SequenceTracker;
use crate::{FrameIndex, Result};

/// Reassembly limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Incomplete frames kept per stream before the oldest is evicted
    pub max_pending_frames: usize,
    /// Frames larger than this are dropped
    pub max_frame_bytes: usize,
    /// Key frame timestamps remembered per stream
    pub key_frame_history: usize,
    /// A key frame this many indices behind the last release restarts the stream
    pub restart_threshold: u32,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: 32,
            max_frame_bytes: 4 * 1024 * 1024,
            key_frame_history: 16,
            restart_threshold: 1024,
        }
    }
}

/// Counters kept across all streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblyStats {
    pub packets_received: u64,
    pub frames_emitted: u64,
    pub duplicate_packets: u64,
    /// Packets for frames already released
    pub stale_packets: u64,
    /// Incomplete groups superseded by a newer frame
    pub stale_groups: u64,
    /// Delta frames dropped because their key frame never arrived
    pub missing_key_frames: u64,
    pub sequence_gaps: u64,
    pub reordered_packets: u64,
    pub oversize_frames: u64,
    pub evicted_groups: u64,
    pub stream_restarts: u64,
    pub malformed: u64,
}

type StreamKey = (StreamType, u8);

#[derive(Debug)]
struct FrameGroup {
    header: StreamPacketHeader,
    parts: BTreeMap<u64, Bytes>,
    first: Option<u64>,
    last: Option<u64>,
    bytes: usize,
    oversize: bool,
}

impl FrameGroup {
    fn new(header: StreamPacketHeader) -> Self {
        Self {
            header,
            parts: BTreeMap::new(),
            first: None,
            last: None,
            bytes: 0,
            oversize: false,
        }
    }

    fn is_complete(&self) -> bool {
        match (self.first, self.last) {
            (Some(first), Some(last)) if last >= first => {
                let expected = last - first + 1;
                self.parts.range(first..=last).count() as u64 == expected
            }
            _ => false,
        }
    }

    fn assemble(&self) -> Bytes {
        let (Some(first), Some(last)) = (self.first, self.last) else {
            return Bytes::new();
        };
        let mut payload = BytesMut::with_capacity(self.bytes);
        for part in self.parts.range(first..=last).map(|(_, part)| part) {
            payload.extend_from_slice(part);
        }
        payload.freeze()
    }
}

#[derive(Debug, Default)]
struct StreamState {
    sequence: SequenceTracker,
    groups: BTreeMap<FrameIndex, FrameGroup>,
    last_emitted: Option<FrameIndex>,
    key_timestamps: VecDeque<u32>,
}

impl StreamState {
    fn remember_key(&mut self, timestamp: u32, history: usize) {
        if self.key_timestamps.contains(&timestamp) {
            return;
        }
        self.key_timestamps.push_back(timestamp);
        while self.key_timestamps.len() > history.max(1) {
            self.key_timestamps.pop_front();
        }
    }

    fn knows_key(&self, timestamp: u32) -> bool {
        self.key_timestamps.contains(&timestamp)
    }
}

/// Rebuilds [`MediaFrame`]s from [`StreamPacket`]s
#[derive(Debug, Default)]
pub struct PacketReassembler {
    config: ReassemblyConfig,
    streams: HashMap<StreamKey, StreamState>,
    stats: ReassemblyStats,
}

impl PacketReassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            stats: ReassemblyStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn stats(&self) -> ReassemblyStats {
        let mut stats = self.stats.clone();
        for stream in self.streams.values() {
            stats.sequence_gaps += stream.sequence.gaps();
            stats.reordered_packets += stream.sequence.reordered();
        }
        stats
    }

    /// Incomplete frames held across all streams
    pub fn pending_frames(&self) -> usize {
        self.streams.values().map(|s| s.groups.len()).sum()
    }

    /// Index of the last frame released for a stream
    pub fn last_emitted(&self, stream_type: StreamType, stream_index: u8) -> Option<FrameIndex> {
        self.streams
            .get(&(stream_type, stream_index))
            .and_then(|s| s.last_emitted)
    }

    /// Forget everything about one stream, e.g. after a stream switch or seek
    pub fn reset_stream(&mut self, stream_type: StreamType, stream_index: u8) {
        if let Some(state) = self.streams.remove(&(stream_type, stream_index)) {
            self.fold_sequence_stats(&state);
            debug!(%stream_type, stream_index, pending = state.groups.len(), "stream reset");
        }
    }

    /// Forget all streams. Counters are kept.
    pub fn reset(&mut self) {
        let streams = std::mem::take(&mut self.streams);
        for state in streams.values() {
            self.fold_sequence_stats(state);
        }
    }

    fn fold_sequence_stats(&mut self, state: &StreamState) {
        self.stats.sequence_gaps += state.sequence.gaps();
        self.stats.reordered_packets += state.sequence.reordered();
    }

    /// Parse and feed a raw stream packet
    pub fn feed_bytes(&mut self, data: Bytes) -> Result<Option<MediaFrame>> {
        match StreamPacket::parse(data) {
            Ok(packet) => Ok(self.feed(packet)),
            Err(e) => {
                self.stats.malformed += 1;
                trace!(error = %e, "malformed stream packet");
                Err(e)
            }
        }
    }

    /// Feed one packet; returns a frame when this packet completes one
    pub fn feed(&mut self, packet: StreamPacket) -> Option<MediaFrame> {
        self.stats.packets_received += 1;
        let header = packet.header;
        let key = (header.stream_type, header.stream_index);

        if self.should_restart(key, &header) {
            self.reset_stream(key.0, key.1);
            self.stats.stream_restarts += 1;
        }

        let state = self.streams.entry(key).or_default();
        let ext_seq = state.sequence.extend(header.sequence);

        trace!(
            stream_type = %header.stream_type,
            stream_index = header.stream_index,
            frame_index = header.frame_index,
            seq = header.sequence,
            role = ?header.role,
            "stream packet"
        );

        if state.last_emitted.is_some_and(|last| header.frame_index <= last) {
            self.stats.stale_packets += 1;
            return None;
        }

        let group = state
            .groups
            .entry(header.frame_index)
            .or_insert_with(|| FrameGroup::new(header));

        if group.parts.contains_key(&ext_seq) {
            self.stats.duplicate_packets += 1;
            return None;
        }

        if header.role.starts_frame() {
            group.first = Some(ext_seq);
            // The first packet carries the authoritative frame attributes.
            group.header = header;
        }
        if header.role.ends_frame() {
            group.last = Some(ext_seq);
        }

        if !group.oversize && group.bytes + packet.payload.len() > self.config.max_frame_bytes {
            debug!(frame_index = header.frame_index, bytes = group.bytes, "frame exceeds size limit");
            group.oversize = true;
            group.parts.values_mut().for_each(|part| *part = Bytes::new());
        }
        if group.oversize {
            group.parts.insert(ext_seq, Bytes::new());
        } else {
            group.bytes += packet.payload.len();
            group.parts.insert(ext_seq, packet.payload);
        }

        if !group.is_complete() {
            if state.groups.len() > self.config.max_pending_frames {
                if let Some((evicted, _)) = state.groups.pop_first() {
                    self.stats.evicted_groups += 1;
                    debug!(frame_index = evicted, "evicted incomplete frame");
                }
            }
            return None;
        }

        let group = state.groups.remove(&header.frame_index)?;

        if group.oversize {
            self.stats.oversize_frames += 1;
            return None;
        }

        let frame_header = group.header;
        let is_video = frame_header.stream_type == StreamType::Video;
        if is_video && frame_header.is_key_frame() {
            state.remember_key(frame_header.frame_timestamp, self.config.key_frame_history);
        } else if is_video && !state.knows_key(frame_header.keyframe_timestamp) {
            self.stats.missing_key_frames += 1;
            debug!(
                frame_index = frame_header.frame_index,
                keyframe_timestamp = frame_header.keyframe_timestamp,
                "delta frame without its key frame, discarding"
            );
            return None;
        }

        let superseded: Vec<FrameIndex> = state
            .groups
            .range(..frame_header.frame_index)
            .map(|(index, _)| *index)
            .collect();
        for index in superseded {
            state.groups.remove(&index);
            self.stats.stale_groups += 1;
        }
        state.last_emitted = Some(frame_header.frame_index);
        self.stats.frames_emitted += 1;

        Some(MediaFrame {
            stream_type: frame_header.stream_type,
            stream_index: frame_header.stream_index,
            frame_index: frame_header.frame_index,
            key_frame: frame_header.is_key_frame(),
            timestamp: frame_header.frame_timestamp,
            keyframe_timestamp: frame_header.keyframe_timestamp,
            payload: group.assemble(),
        })
    }

    /// A device that restarts its encoder begins again from a low frame index
    /// with a key frame; without this every later packet would look stale.
    fn should_restart(&self, key: StreamKey, header: &StreamPacketHeader) -> bool {
        if !header.is_key_frame() || !header.role.starts_frame() {
            return false;
        }
        match self.streams.get(&key).and_then(|s| s.last_emitted) {
            Some(last) => header.frame_index.saturating_add(self.config.restart_threshold) < last,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FrameType, PackRole};

    fn packet(
        frame_index: u32,
        seq: u16,
        role: PackRole,
        key: bool,
        timestamp: u32,
        key_ts: u32,
        payload: &'static [u8],
    ) -> StreamPacket {
        StreamPacket::new(
            StreamPacketHeader {
                frame_timestamp: timestamp,
                keyframe_timestamp: key_ts,
                sequence: seq,
                payload_size: 0,
                role,
                frame_type: if key { FrameType::Key } else { FrameType::Delta },
                stream_type: StreamType::Video,
                stream_index: 0,
                frame_index,
            },
            Bytes::from_static(payload),
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_packet_counted() {
        let mut reassembler = PacketReassembler::default();
        assert!(reassembler.feed(packet(1, 10, PackRole::First, true, 0, 0, b"a")).is_none());
        assert!(reassembler.feed(packet(1, 10, PackRole::First, true, 0, 0, b"a")).is_none());
        let frame = reassembler.feed(packet(1, 11, PackRole::Last, true, 0, 0, b"b")).unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"ab"));
        assert_eq!(reassembler.stats().duplicate_packets, 1);
    }

    #[test]
    fn test_superseded_group_dropped() {
        let mut reassembler = PacketReassembler::default();
        reassembler.feed(packet(1, 1, PackRole::Only, true, 100, 100, b"k"));
        // Frame 2 never completes.
        reassembler.feed(packet(2, 2, PackRole::First, false, 140, 100, b"x"));
        let frame = reassembler.feed(packet(3, 4, PackRole::Only, false, 180, 100, b"z")).unwrap();
        assert_eq!(frame.frame_index, 3);
        assert_eq!(reassembler.pending_frames(), 0);
        assert_eq!(reassembler.stats().stale_groups, 1);

        // The missing tail of frame 2 is now stale.
        assert!(reassembler.feed(packet(2, 3, PackRole::Last, false, 140, 100, b"y")).is_none());
        assert_eq!(reassembler.stats().stale_packets, 1);
        assert_eq!(reassembler.stats().sequence_gaps, 1);
    }

    #[test]
    fn test_oversize_frame_dropped() {
        let mut reassembler = PacketReassembler::new(ReassemblyConfig {
            max_frame_bytes: 4,
            ..Default::default()
        });
        reassembler.feed(packet(1, 1, PackRole::First, true, 0, 0, b"abc"));
        assert!(reassembler.feed(packet(1, 2, PackRole::Last, true, 0, 0, b"def")).is_none());
        assert_eq!(reassembler.stats().oversize_frames, 1);
        assert_eq!(reassembler.pending_frames(), 0);
    }

    #[test]
    fn test_pending_limit_evicts_oldest() {
        let mut reassembler = PacketReassembler::new(ReassemblyConfig {
            max_pending_frames: 2,
            ..Default::default()
        });
        for i in 0..3u32 {
            reassembler.feed(packet(i + 1, i as u16 * 2, PackRole::First, true, 0, 0, b"p"));
        }
        assert_eq!(reassembler.pending_frames(), 2);
        assert_eq!(reassembler.stats().evicted_groups, 1);
    }

    #[test]
    fn test_encoder_restart_accepted() {
        let mut reassembler = PacketReassembler::new(ReassemblyConfig {
            restart_threshold: 10,
            ..Default::default()
        });
        assert!(reassembler.feed(packet(500, 1, PackRole::Only, true, 10, 10, b"a")).is_some());
        let frame = reassembler.feed(packet(0, 2, PackRole::Only, true, 20, 20, b"b")).unwrap();
        assert_eq!(frame.frame_index, 0);
        assert_eq!(reassembler.stats().stream_restarts, 1);
    }

    #[test]
    fn test_malformed_bytes_counted() {
        let mut reassembler = PacketReassembler::default();
        assert!(reassembler.feed_bytes(Bytes::from_static(b"short")).is_err());
        assert_eq!(reassembler.stats().malformed, 1);
    }
}
