//! Shared helpers for session-core integration tests
//!
//! Sessions run against a scripted device: the [`MemoryFactory`] hands the
//! registry in-memory endpoints and passes the device end of every link
//! (including redials) to the test as a [`FakeDevice`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_command_core::{CommandCode, CommandEnvelope, EnvelopeKind};
use camlink_session_core::prelude::*;
use camlink_session_core::{EndpointFactory, SessionRegistry};
use camlink_stream_core::{Packetizer, StreamPacket, StreamType};
use camlink_transport_core::{
    DeviceAddress, Endpoint, Frame, Link, MemoryDialer, MemoryLink, PacketType, TransportConfig,
    TransportHint, TransportKind,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// Builds in-memory endpoints and forwards each device end to the test
pub struct MemoryFactory {
    links: mpsc::UnboundedSender<MemoryLink>,
    connects: AtomicUsize,
    hints: Mutex<Vec<TransportHint>>,
}

impl MemoryFactory {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn hints(&self) -> Vec<TransportHint> {
        self.hints.lock().clone()
    }
}

#[async_trait]
impl EndpointFactory for MemoryFactory {
    async fn connect(&self, _record: &DeviceRecord, hint: TransportHint, config: &TransportConfig) -> Result<Endpoint> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().push(hint);
        let links = self.links.clone();
        let dialer = MemoryDialer::new(move || {
            let (client, device) = MemoryLink::pair(TransportKind::P2p);
            links
                .send(device)
                .map_err(|_| camlink_transport_core::Error::Socket("test device gone".into()))?;
            Ok(Arc::new(client) as Arc<dyn Link>)
        });
        Ok(Endpoint::connect(Arc::new(dialer), config.clone()).await?)
    }
}

/// Every event and media frame the registry delivered
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    media: Mutex<Vec<MediaEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }

    async fn on_media(&self, media: MediaEvent) {
        self.media.lock().push(media);
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn media(&self) -> Vec<MediaEvent> {
        self.media.lock().clone()
    }

    /// Wait until an event matching `pred` has been delivered
    pub async fn wait_event(&self, pred: impl Fn(&Event) -> bool) -> Event {
        for _ in 0..500 {
            if let Some(event) = self.events.lock().iter().find(|e| pred(e)).cloned() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event never arrived; got {:?}", self.events());
    }

    /// Wait until at least `count` media frames have been delivered
    pub async fn wait_media(&self, count: usize) -> Vec<MediaEvent> {
        for _ in 0..500 {
            if self.media.lock().len() >= count {
                return self.media();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} media frames, got {}", count, self.media.lock().len());
    }
}

/// The device end of one link
pub struct FakeDevice {
    pub link: MemoryLink,
    packetizers: Mutex<HashMap<(StreamType, u8), Packetizer>>,
}

impl FakeDevice {
    pub fn new(link: MemoryLink) -> Self {
        Self {
            link,
            packetizers: Mutex::new(HashMap::new()),
        }
    }

    /// Next control request, skipping media
    pub async fn recv_request(&self) -> CommandEnvelope {
        loop {
            let frame = self.link.recv_frame().await.expect("link open");
            if frame.packet_type() != PacketType::Control {
                continue;
            }
            let envelope = CommandEnvelope::decode(frame.body).expect("valid envelope");
            assert_eq!(envelope.kind, EnvelopeKind::Request);
            return envelope;
        }
    }

    /// Next control request, which must carry `code`
    pub async fn expect(&self, code: CommandCode) -> CommandEnvelope {
        let request = self.recv_request().await;
        assert_eq!(request.code, code, "unexpected request {:?}", request);
        request
    }

    /// Next media packet, skipping control traffic
    pub async fn recv_media(&self) -> StreamPacket {
        loop {
            let frame = self.link.recv_frame().await.expect("link open");
            if frame.packet_type() == PacketType::Media {
                return StreamPacket::parse(frame.body).expect("valid stream packet");
            }
        }
    }

    pub async fn reply<T: Serialize>(&self, request: &CommandEnvelope, result: i32, body: &T) {
        let payload = Bytes::from(serde_json::to_vec(body).unwrap());
        self.send_envelope(&request.response(result, payload)).await;
    }

    pub async fn ack(&self, request: &CommandEnvelope) {
        self.send_envelope(&request.response(0, Bytes::new())).await;
    }

    pub async fn reject(&self, request: &CommandEnvelope, result: i32) {
        self.send_envelope(&request.response(result, Bytes::new())).await;
    }

    pub async fn notify<T: Serialize>(&self, code: CommandCode, channel: Option<u16>, body: &T) {
        let mut envelope = CommandEnvelope::notify(code, "device").with_json(body).unwrap();
        envelope.channel = channel;
        self.send_envelope(&envelope).await;
    }

    pub async fn send_envelope(&self, envelope: &CommandEnvelope) {
        let frame = Frame::from_device(PacketType::Control, envelope.encode().unwrap());
        self.link.send_frame(&frame).await.unwrap();
    }

    /// Send one media frame, split into packets
    pub async fn send_media(&self, stream_type: StreamType, stream_index: u8, payload: &[u8], timestamp: u32) {
        let packets = {
            let mut packetizers = self.packetizers.lock();
            let packetizer = packetizers
                .entry((stream_type, stream_index))
                .or_insert_with(|| Packetizer::new(stream_type, stream_index).with_max_payload(64));
            packetizer
                .packetize(Bytes::copy_from_slice(payload), timestamp, true)
                .unwrap()
        };
        for packet in packets {
            self.send_packet(&packet).await;
        }
    }

    pub async fn send_packet(&self, packet: &StreamPacket) {
        let frame = Frame::from_device(PacketType::Media, packet.serialize());
        self.link.send_frame(&frame).await.unwrap();
    }

    /// True once the client end has hung up
    pub async fn hung_up(&self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.link.recv_frame()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// A registry wired to a [`MemoryFactory`]
pub struct Harness {
    pub registry: SessionRegistry,
    pub factory: Arc<MemoryFactory>,
    pub directory: Arc<StaticDirectory>,
    pub recorder: Arc<Recorder>,
    links: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryLink>>,
}

/// Route registry logs to the test output, once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> CamlinkConfig {
    let mut config = CamlinkConfig::default();
    config.transport.heartbeat_interval_ms = 0;
    config.command.response_timeout_ms = 1_000;
    config.session.reconnect_delay_ms = 50;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CamlinkConfig) -> Self {
        init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(MemoryFactory {
            links: tx,
            connects: AtomicUsize::new(0),
            hints: Mutex::new(Vec::new()),
        });
        let directory = Arc::new(
            StaticDirectory::new()
                .with(DeviceRecord::camera(DeviceAddress::new("D1")))
                .with(DeviceRecord::recorder(DeviceAddress::new("NVR1"), 4)),
        );
        let recorder = Arc::new(Recorder::default());
        let registry = SessionRegistry::new(
            config,
            directory.clone(),
            factory.clone(),
            Some(recorder.clone()),
        )
        .unwrap();
        Self {
            registry,
            factory,
            directory,
            recorder,
            links: tokio::sync::Mutex::new(rx),
        }
    }

    /// The device end of the next link the registry dials
    pub async fn next_device(&self) -> FakeDevice {
        let link = self.links.lock().await.recv().await.expect("factory alive");
        FakeDevice::new(link)
    }

    /// Open in the background so the test can play the device
    pub fn spawn_open(
        &self,
        device_id: &str,
        kind: SessionKind,
        stream_index: u8,
        params: OpenParams,
    ) -> tokio::task::JoinHandle<Result<SessionHandle>> {
        let registry = self.registry.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move { registry.open(&device_id, kind, stream_index, params).await })
    }

    /// Run a registry call in the background
    pub fn spawn_with<T, F, Fut>(&self, f: F) -> tokio::task::JoinHandle<T>
    where
        F: FnOnce(SessionRegistry) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(self.registry.clone()))
    }

    /// Open a recorder replay on channel 1 and bring it to `Active`
    pub async fn active_replay(&self) -> (SessionHandle, FakeDevice) {
        let request = ReplayRequest {
            channel: 1,
            file: None,
            start_time: 1_700_000_000,
            end_time: 1_700_003_600,
        };
        let open = self.spawn_open("NVR1", SessionKind::Replay, 0, OpenParams::replay(request));
        let device = self.next_device().await;
        let start = device.expect(camlink_session_core::commands::replay::PLAY_START).await;
        let body: ReplayRequest = start.json().unwrap();
        assert_eq!(body.channel, 1);
        let answer = ReplayResponse {
            video_secs: 3600,
            ..Default::default()
        };
        device.reply(&start, 0, &answer).await;
        let handle = open.await.unwrap().unwrap();
        device.send_media(StreamType::Video, REPLAY_STREAM_INDEX, b"frame-0", 0).await;
        self.registry
            .wait_for_state(&handle, SessionState::Active, Duration::from_secs(5))
            .await
            .unwrap();
        (handle, device)
    }

    /// Open a watch and bring it to `Active` with one frame
    pub async fn active_watch(&self, device_id: &str, stream_index: u8, params: OpenParams) -> (SessionHandle, FakeDevice) {
        let open = self.spawn_open(device_id, SessionKind::Watch, stream_index, params);
        let device = self.next_device().await;
        let request = device.expect(camlink_session_core::commands::live::START_WATCH).await;
        device.reply(&request, 0, &WatchResponse::default()).await;
        let handle = open.await.unwrap().unwrap();
        device.send_media(StreamType::Video, stream_index, b"first", 0).await;
        self.registry
            .wait_for_state(&handle, SessionState::Active, Duration::from_secs(5))
            .await
            .unwrap();
        (handle, device)
    }

    /// Close in the background, acknowledging the stop request
    pub async fn close_acked(&self, handle: &SessionHandle, device: &FakeDevice) {
        let registry = self.registry.clone();
        let target = handle.clone();
        let close = tokio::spawn(async move { registry.close(&target).await });
        let stop = device.recv_request().await;
        device.ack(&stop).await;
        close.await.unwrap().unwrap();
    }
}
