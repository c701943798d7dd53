use bytes::Bytes;
use camlink_stream_core::prelude::*;
use proptest::prelude::*;

fn header(frame_index: u32, seq: u16, role: PackRole, key: bool) -> StreamPacketHeader {
    StreamPacketHeader {
        frame_timestamp: frame_index * 40,
        keyframe_timestamp: 0,
        sequence: seq,
        payload_size: 0,
        role,
        frame_type: if key { FrameType::Key } else { FrameType::Delta },
        stream_type: StreamType::Video,
        stream_index: 0,
        frame_index,
    }
}

fn packet(frame_index: u32, seq: u16, role: PackRole, payload: &'static [u8]) -> StreamPacket {
    StreamPacket::new(header(frame_index, seq, role, true), Bytes::from_static(payload)).unwrap()
}

#[test]
fn test_frame_assembled_from_first_middle_last() {
    let mut reassembler = PacketReassembler::default();

    assert!(reassembler.feed(packet(7, 100, PackRole::First, b"AA")).is_none());
    assert!(reassembler.feed(packet(7, 101, PackRole::Middle, b"BB")).is_none());
    let frame = reassembler
        .feed(packet(7, 102, PackRole::Last, b"CC"))
        .expect("frame 7 complete");

    assert_eq!(frame.frame_index, 7);
    assert_eq!(frame.payload, Bytes::from_static(b"AABBCC"));
    assert!(frame.key_frame);
    assert_eq!(frame.stream_type, StreamType::Video);
    assert_eq!(reassembler.stats().frames_emitted, 1);
    assert_eq!(reassembler.pending_frames(), 0);
}

#[test]
fn test_out_of_order_arrival_uses_sequence_order() {
    let mut reassembler = PacketReassembler::default();

    assert!(reassembler.feed(packet(7, 102, PackRole::Last, b"CC")).is_none());
    assert!(reassembler.feed(packet(7, 100, PackRole::First, b"AA")).is_none());
    let frame = reassembler.feed(packet(7, 101, PackRole::Middle, b"BB")).unwrap();
    assert_eq!(frame.payload, Bytes::from_static(b"AABBCC"));
}

#[test]
fn test_missing_middle_holds_frame_back() {
    let mut reassembler = PacketReassembler::default();
    reassembler.feed(packet(3, 10, PackRole::First, b"a"));
    assert!(reassembler.feed(packet(3, 12, PackRole::Last, b"c")).is_none());
    assert_eq!(reassembler.pending_frames(), 1);
}

#[test]
fn test_sequence_wrap_is_not_loss() {
    let mut reassembler = PacketReassembler::default();

    assert!(reassembler.feed(packet(1, 65534, PackRole::First, b"1")).is_none());
    assert!(reassembler.feed(packet(1, 65535, PackRole::Middle, b"2")).is_none());
    let frame = reassembler.feed(packet(1, 0, PackRole::Last, b"3")).unwrap();
    assert_eq!(frame.payload, Bytes::from_static(b"123"));

    let next = reassembler.feed(packet(2, 1, PackRole::Only, b"4")).unwrap();
    assert_eq!(next.frame_index, 2);

    let stats = reassembler.stats();
    assert_eq!(stats.sequence_gaps, 0);
    assert_eq!(stats.stale_packets, 0);
    assert_eq!(stats.frames_emitted, 2);
}

#[test]
fn test_reverse_arrival_across_wrap() {
    let mut reassembler = PacketReassembler::default();

    assert!(reassembler.feed(packet(5, 1, PackRole::Last, b"c")).is_none());
    assert!(reassembler.feed(packet(5, 0, PackRole::Middle, b"b")).is_none());
    let frame = reassembler
        .feed(packet(5, 65535, PackRole::First, b"a"))
        .expect("frame 5 complete");
    assert_eq!(frame.payload, Bytes::from_static(b"abc"));
    assert_eq!(reassembler.pending_frames(), 0);

    let next = reassembler.feed(packet(6, 2, PackRole::Only, b"d")).unwrap();
    assert_eq!(next.frame_index, 6);
    assert_eq!(reassembler.stats().sequence_gaps, 0);
}

#[test]
fn test_delta_frame_without_key_frame_is_discarded() {
    let mut reassembler = PacketReassembler::default();

    let mut orphan = header(5, 1, PackRole::Only, false);
    orphan.keyframe_timestamp = 999;
    assert!(
        reassembler
            .feed(StreamPacket::new(orphan, Bytes::from_static(b"d")).unwrap())
            .is_none()
    );
    assert_eq!(reassembler.stats().missing_key_frames, 1);

    // A later key frame and its dependents still flow.
    let key = reassembler.feed(packet(6, 2, PackRole::Only, b"k")).unwrap();
    let mut delta = header(7, 3, PackRole::Only, false);
    delta.keyframe_timestamp = key.timestamp;
    let frame = reassembler
        .feed(StreamPacket::new(delta, Bytes::from_static(b"d")).unwrap())
        .unwrap();
    assert_eq!(frame.frame_index, 7);
    assert!(!frame.key_frame);
}

#[test]
fn test_audio_is_not_gated_on_key_frames() {
    let mut reassembler = PacketReassembler::default();
    let mut audio = header(1, 1, PackRole::Only, false);
    audio.stream_type = StreamType::Audio;
    audio.keyframe_timestamp = 12345;
    let frame = reassembler
        .feed(StreamPacket::new(audio, Bytes::from_static(b"pcm")).unwrap())
        .unwrap();
    assert_eq!(frame.stream_type, StreamType::Audio);
}

#[test]
fn test_streams_are_independent() {
    let mut reassembler = PacketReassembler::default();
    let mut sub = header(1, 500, PackRole::First, true);
    sub.stream_index = 1;

    reassembler.feed(StreamPacket::new(sub, Bytes::from_static(b"s")).unwrap());
    assert!(reassembler.feed(packet(9, 1, PackRole::Only, b"m")).is_some());

    // Main stream progress does not make the sub stream's frame 1 stale.
    sub.sequence = 501;
    sub.role = PackRole::Last;
    let frame = reassembler
        .feed(StreamPacket::new(sub, Bytes::from_static(b"t")).unwrap())
        .unwrap();
    assert_eq!(frame.stream_index, 1);
    assert_eq!(frame.payload, Bytes::from_static(b"st"));
}

#[test]
fn test_packetizer_output_reassembles() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut packetizer = Packetizer::new(StreamType::Audio, 0)
        .with_max_payload(700)
        .with_initial_sequence(65530);
    let packets = packetizer
        .packetize(Bytes::from(payload.clone()), 1000, true)
        .unwrap();

    let mut reassembler = PacketReassembler::default();
    let mut frames: Vec<MediaFrame> = packets
        .into_iter()
        .filter_map(|p| reassembler.feed_bytes(p.serialize()).unwrap())
        .collect();
    assert_eq!(frames.len(), 1);
    let frame = frames.remove(0);
    assert_eq!(frame.payload.as_ref(), payload.as_slice());

    let mut out = vec![0u8; payload.len()];
    assert_eq!(frame.read_into(&mut out), Ok(payload.len()));
}

fn split_frame(start_seq: u16, chunks: &[Vec<u8>]) -> Vec<StreamPacket> {
    let count = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let role = match (i == 0, i + 1 == count) {
                (true, true) => PackRole::Only,
                (true, false) => PackRole::First,
                (false, true) => PackRole::Last,
                (false, false) => PackRole::Middle,
            };
            let seq = start_seq.wrapping_add(i as u16);
            StreamPacket::new(header(42, seq, role, true), Bytes::from(chunk.clone())).unwrap()
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_frame_emitted_only_when_all_packets_arrived(
        start_seq in prop_oneof![Just(65530u16), any::<u16>()],
        (chunks, order) in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..10)
            .prop_flat_map(|chunks| {
                let n = chunks.len();
                (Just(chunks), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
            })
    ) {
        let packets = split_frame(start_seq, &chunks);
        let mut reassembler = PacketReassembler::default();

        let mut emitted = Vec::new();
        for (fed, &i) in order.iter().enumerate() {
            if let Some(frame) = reassembler.feed(packets[i].clone()) {
                emitted.push((fed, frame));
            }
        }

        prop_assert_eq!(emitted.len(), 1);
        let (at, frame) = &emitted[0];
        prop_assert_eq!(*at, order.len() - 1);
        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(frame.payload.as_ref(), expected.as_slice());
        prop_assert_eq!(reassembler.pending_frames(), 0);
    }
}
