//! Registry tests: session uniqueness, endpoint sharing and teardown,
//! correlator timeouts and the device-wide switches.

mod common;

use std::time::Duration;

use bytes::Bytes;
use camlink_command_core::{CommandCode, MessageFamily};
use camlink_session_core::commands::live;
use camlink_session_core::prelude::*;
use camlink_session_core::{SessionFault, TransportFault, errors::legacy};
use camlink_transport_core::{TransportHint, TransportKind};
use common::*;

#[tokio::test]
async fn test_duplicate_watch_open_returns_same_handle() {
    let h = Harness::new();
    let (first, _device) = h.active_watch("D1", 0, OpenParams::default()).await;

    let second = h
        .registry
        .open("D1", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.factory.connects(), 1);
    let view = h.registry.lookup("D1").unwrap();
    assert_eq!(view.sessions.len(), 1);
    assert_eq!(view.transport.unwrap().kind, TransportKind::P2p);
}

#[tokio::test]
async fn test_sub_stream_reuses_endpoint() {
    let h = Harness::new();
    let (main, device) = h.active_watch("D1", 0, OpenParams::default()).await;

    let open = h.spawn_open("D1", SessionKind::Watch, 1, OpenParams::default());
    let request = device.expect(live::START_WATCH).await;
    let body: WatchRequest = request.json().unwrap();
    assert_eq!(body.stream_index, 1);
    device.reply(&request, 0, &WatchResponse::default()).await;
    let sub = open.await.unwrap().unwrap();

    assert_ne!(main.id, sub.id);
    assert_eq!(h.factory.connects(), 1);
    assert_eq!(h.registry.lookup("D1").unwrap().sessions.len(), 2);
}

#[tokio::test]
async fn test_unknown_and_rejected_devices() {
    let h = Harness::new();

    let err = h
        .registry
        .open("NOPE", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, Error::not_found("NOPE"));
    assert_eq!(err.legacy_code(), legacy::NOT_FOUND);

    h.directory.reject_credentials("D1");
    let err = h
        .registry
        .open("D1", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, SessionFault::AuthFailed.into());
    h.recorder
        .wait_event(|e| matches!(e, Event::AuthFailed { device_id } if device_id == "D1"))
        .await;
    assert_eq!(h.factory.connects(), 0);
}

#[tokio::test]
async fn test_invalid_open_parameters() {
    let h = Harness::new();
    let err = h
        .registry
        .open("D1", SessionKind::Watch, 2, OpenParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Session(SessionFault::InvalidArgument(_))));

    let err = h
        .registry
        .open("NVR1", SessionKind::Replay, 0, OpenParams::channel(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Session(SessionFault::InvalidArgument(_))));

    let err = h
        .registry
        .open("NVR1", SessionKind::Watch, 0, OpenParams::channel(9))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Session(SessionFault::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn test_silent_command_times_out_after_every_attempt() {
    let h = Harness::new();
    let code = CommandCode::new(MessageFamily::SystemControl, 42);
    let registry = h.registry.clone();
    let request = tokio::spawn(async move { registry.request("NVR1", code, Some(3), Bytes::new()).await });

    let device = h.next_device().await;
    let started = tokio::time::Instant::now();
    for _ in 0..3 {
        let sent = device.recv_request().await;
        assert_eq!(sent.code, code);
        assert_eq!(sent.channel, Some(3));
    }

    let err = request.await.unwrap().unwrap_err();
    assert_eq!(err, TransportFault::ResponseTimeout { code, attempts: 3 }.into());
    assert_eq!(err.legacy_code(), legacy::RSP_TIMEOUT);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(h.registry.pending_commands().is_empty());
    // the transient endpoint is released with the request
    assert!(device.hung_up().await);
}

#[tokio::test]
async fn test_request_returns_device_answer() {
    let h = Harness::new();
    let code = CommandCode::new(MessageFamily::ConfigGet, 7);
    let registry = h.registry.clone();
    let request = tokio::spawn(async move { registry.request("NVR1", code, Some(2), Bytes::new()).await });

    let device = h.next_device().await;
    let sent = device.recv_request().await;
    // configuration on a recorder channel passes through to the camera
    assert_eq!(sent.route, camlink_command_core::Route::Transparent(2));
    device.reply(&sent, 0, &serde_json::json!({ "brightness": 40 })).await;

    let response = request.await.unwrap().unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["brightness"], 40);
    h.recorder
        .wait_event(|e| matches!(e, Event::Response { code: c, .. } if *c == code))
        .await;
    assert!(h.registry.lookup("NVR1").unwrap().transport.is_none());
}

#[tokio::test]
async fn test_device_error_maps_to_fault() {
    let h = Harness::new();
    let open = h.spawn_open("NVR1", SessionKind::Watch, 0, OpenParams::channel(3));
    let device = h.next_device().await;
    let request = device.expect(live::START_WATCH).await;
    device.reject(&request, legacy::CHANNEL_OFFLINE).await;

    let err = open.await.unwrap().unwrap_err();
    assert_eq!(err, SessionFault::ChannelOffline(3).into());
    assert!(device.hung_up().await);
    assert!(h.registry.lookup("NVR1").unwrap().sessions.is_empty());
}

#[tokio::test]
async fn test_closing_last_session_releases_endpoint() {
    let h = Harness::new();
    let (handle, device) = h.active_watch("D1", 0, OpenParams::default()).await;

    h.close_acked(&handle, &device).await;

    assert!(device.hung_up().await);
    let view = h.registry.lookup("D1").unwrap();
    assert!(view.transport.is_none());
    assert!(view.sessions.is_empty());
    assert_eq!(h.registry.session(&handle), None);

    h.recorder
        .wait_event(|e| matches!(e, Event::SessionState { to: SessionState::Closed, .. }))
        .await;
    let path: Vec<SessionState> = h
        .recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::SessionState { handle: hd, to, .. } if hd.id == handle.id => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        path,
        vec![
            SessionState::Negotiating,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed
        ]
    );
}

#[tokio::test]
async fn test_stop_and_resume_communication() {
    let h = Harness::new();
    let (handle, device) = h.active_watch("D1", 0, OpenParams::default()).await;

    h.registry.stop_communication("D1").await.unwrap();
    assert!(device.hung_up().await);
    assert_eq!(h.registry.session(&handle), None);

    let err = h
        .registry
        .open("D1", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, SessionFault::CommunicationStopped.into());

    h.registry.resume_communication("D1").unwrap();
    let (again, _device) = h.active_watch("D1", 0, OpenParams::default()).await;
    assert_ne!(again.id, handle.id);
    assert_eq!(h.factory.connects(), 2);
}

#[tokio::test]
async fn test_sub_stream_forced_through_relay() {
    let h = Harness::new();
    h.registry.force_substream_by_relay(true);
    let (_handle, _device) = h.active_watch("D1", 1, OpenParams::default()).await;
    assert_eq!(h.factory.hints(), vec![TransportHint::RelayOnly]);
}

#[tokio::test]
async fn test_p2p_timeout_bounds() {
    let h = Harness::new();
    assert!(matches!(
        h.registry.set_p2p_timeout(Duration::ZERO),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        h.registry.set_p2p_timeout(Duration::from_secs(3600)),
        Err(Error::Config(_))
    ));
    h.registry.set_p2p_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(h.registry.config().transport.p2p_timeout_ms, 10_000);
}

#[tokio::test]
async fn test_device_status_override() {
    let h = Harness::new();
    let (_handle, _device) = h.active_watch("NVR1", 0, OpenParams::channel(0)).await;

    h.registry
        .set_device_status("NVR1", OnlineStatus::HeartbeatLost)
        .await
        .unwrap();
    let event = h
        .recorder
        .wait_event(|e| {
            matches!(
                e,
                Event::DeviceStatus {
                    status: OnlineStatus::HeartbeatLost,
                    ..
                }
            )
        })
        .await;
    assert_eq!(event.code(), EventCode::P2pTcpTimeout);
    let info = h.registry.lookup("NVR1").unwrap().info.unwrap();
    assert_eq!(info.status, OnlineStatus::HeartbeatLost);
    assert_eq!(info.device_type, DeviceType::NvrV4);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let h = Harness::new();
    let (_handle, device) = h.active_watch("D1", 0, OpenParams::default()).await;

    h.registry.shutdown().await;

    assert!(device.hung_up().await);
    assert!(h.registry.lookup("D1").is_none());
    let err = h
        .registry
        .open("D1", SessionKind::Watch, 0, OpenParams::default())
        .await
        .unwrap_err();
    assert_eq!(err, SessionFault::CommunicationStopped.into());
}
