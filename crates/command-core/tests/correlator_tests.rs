use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camlink_command_core::prelude::*;
use camlink_transport_core::EndpointId;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Records every envelope it is asked to send
struct RecordingSink {
    tx: mpsc::UnboundedSender<CommandEnvelope>,
}

impl RecordingSink {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CommandEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn send_envelope(&self, envelope: &CommandEnvelope) -> camlink_command_core::Result<()> {
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }
}

const CODE_42: CommandCode = CommandCode::new(MessageFamily::LiveStream, 42);

fn correlator() -> Arc<CommandCorrelator> {
    Arc::new(CommandCorrelator::new(CorrelatorConfig::default()))
}

#[tokio::test(start_paused = true)]
async fn test_timeout_after_exactly_max_attempts() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(3);

    let started = Instant::now();
    let result = correlator
        .request(sink.as_ref(), channel, CommandEnvelope::request(CODE_42, "D1"), None)
        .await;

    assert_eq!(
        result,
        Err(Error::ResponseTimeout {
            code: CODE_42,
            attempts: 3
        })
    );
    assert_eq!(started.elapsed(), Duration::from_secs(9));
    assert_eq!(correlator.pending_count(), 0);

    let mut sends = 0;
    while sent.try_recv().is_ok() {
        sends += 1;
    }
    assert_eq!(sends, 3);
}

#[tokio::test(start_paused = true)]
async fn test_response_resolves_request() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(3);

    let task = {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            correlator
                .request(sink.as_ref(), channel, CommandEnvelope::request(CODE_42, "D1"), Some(7))
                .await
        })
    };

    let request = sent.recv().await.unwrap();
    let pending = correlator.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].owner, Some(7));
    assert_eq!(pending[0].attempts, 1);

    assert!(correlator.resolve(channel, request.response(0, Bytes::from_static(b"{\"ok\":1}"))));
    let response = task.await.unwrap().unwrap();
    assert_eq!(response.kind, EnvelopeKind::Response);
    assert_eq!(response.payload, Bytes::from_static(b"{\"ok\":1}"));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_after_retry_is_accepted() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(4);

    let task = {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            correlator
                .request(sink.as_ref(), channel, CommandEnvelope::request(CODE_42, "D1"), None)
                .await
        })
    };

    let first = sent.recv().await.unwrap();
    let second = sent.recv().await.unwrap();
    assert_eq!(first.correlation, second.correlation);
    assert_eq!(correlator.pending()[0].attempts, 2);

    assert!(correlator.resolve(channel, second.response(0, Bytes::new())));
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_same_key_requests_are_serialized() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(5);

    let spawn_request = |body: &'static [u8]| {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let env = CommandEnvelope::request(CODE_42, "D1").with_payload(Bytes::from_static(body));
            correlator.request(sink.as_ref(), channel, env, None).await
        })
    };

    let first = spawn_request(b"first");
    let first_sent = sent.recv().await.unwrap();
    let second = spawn_request(b"second");
    tokio::task::yield_now().await;

    // The second request waits for the first to finish.
    assert!(sent.try_recv().is_err());
    assert_eq!(correlator.pending_count(), 1);

    correlator.resolve(channel, first_sent.response(0, Bytes::new()));
    assert!(first.await.unwrap().is_ok());

    let second_sent = sent.recv().await.unwrap();
    assert_eq!(second_sent.payload, Bytes::from_static(b"second"));
    correlator.resolve(channel, second_sent.response(0, Bytes::new()));
    assert!(second.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_run_concurrently() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(6);

    for code in [1u16, 2] {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let env = CommandEnvelope::request(CommandCode::new(MessageFamily::ConfigGet, code), "D1");
            correlator.request(sink.as_ref(), channel, env, None).await
        });
    }

    sent.recv().await.unwrap();
    sent.recv().await.unwrap();
    assert_eq!(correlator.pending_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_channel_wakes_in_flight_and_queued() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(8);

    let spawn_request = || {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            correlator
                .request(sink.as_ref(), channel, CommandEnvelope::request(CODE_42, "D1"), None)
                .await
        })
    };

    let in_flight = spawn_request();
    sent.recv().await.unwrap();
    let queued = spawn_request();
    tokio::task::yield_now().await;

    assert_eq!(correlator.cancel_channel(channel), 1);
    assert_eq!(in_flight.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(queued.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(correlator.pending_count(), 0);
    assert!(!correlator.busy_on_channel(channel));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_by_owner_leaves_others() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(10);

    let owned = {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let env = CommandEnvelope::request(CommandCode::new(MessageFamily::NvrReplay, 1), "D1");
            correlator.request(sink.as_ref(), channel, env, Some(1)).await
        })
    };
    let other = {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let env = CommandEnvelope::request(CommandCode::new(MessageFamily::NvrReplay, 2), "D1");
            correlator.request(sink.as_ref(), channel, env, Some(2)).await
        })
    };
    sent.recv().await.unwrap();
    sent.recv().await.unwrap();

    assert_eq!(correlator.cancel_owned_by(1), 1);
    assert_eq!(owned.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(correlator.pending_count(), 1);

    let response = CommandEnvelope::request(CommandCode::new(MessageFamily::NvrReplay, 2), "D1")
        .response(0, Bytes::new());
    assert!(correlator.resolve(channel, response));
    assert!(other.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_transparent_channel_is_part_of_the_key() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(11);

    let task = {
        let correlator = correlator.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let env = CommandEnvelope::request(CODE_42, "NVR").with_route(Route::Transparent(2));
            correlator.request(sink.as_ref(), channel, env, None).await
        })
    };
    let request = sent.recv().await.unwrap();

    let direct = request.clone().with_route(Route::Direct).response(0, Bytes::new());
    assert!(!correlator.resolve(channel, direct));
    assert!(correlator.resolve(channel, request.response(0, Bytes::new())));
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_family_timeout_override() {
    let correlator = CommandCorrelator::new(
        CorrelatorConfig {
            max_attempts: 2,
            ..Default::default()
        }
        .with_family_timeout(MessageFamily::NvrReplay, Duration::from_secs(5)),
    );
    let (sink, _sent) = RecordingSink::new();

    let started = Instant::now();
    let env = CommandEnvelope::request(CommandCode::new(MessageFamily::NvrReplay, 6), "D1");
    let result = correlator.request(sink.as_ref(), EndpointId(12), env, None).await;
    assert!(matches!(result, Err(Error::ResponseTimeout { attempts: 2, .. })));
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_request_leaves_no_entry() {
    let correlator = correlator();
    let (sink, mut sent) = RecordingSink::new();
    let channel = EndpointId(13);

    let options = RequestOptions {
        timeout: Duration::from_secs(1),
        attempts: 1,
    };
    let abandoned = tokio::time::timeout(
        Duration::from_millis(500),
        correlator.request_with(sink.as_ref(), channel, CommandEnvelope::request(CODE_42, "D1"), None, options),
    )
    .await;

    assert!(abandoned.is_err());
    assert!(sent.try_recv().is_ok());
    assert_eq!(correlator.pending_count(), 0);
    assert!(!correlator.busy_on_channel(channel));
}
