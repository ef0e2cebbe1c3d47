//! Integration tests for the session engine against an in-process server

mod harness;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{test_join, test_participant, MockSignalServer, ServerConfig};
use parking_lot::Mutex;
use roomlink_core::protocol::types::*;
use roomlink_core::SignalRequest;
use roomlink_webrtc::{
    DataPacketKind, EngineEvent, EngineEvents, EngineOptions, Error, ReconnectContext,
    ReconnectPolicy, SessionEngine, SessionPhase, TransportState,
};

/// Policy that hands out a fixed script of delays and records every
/// consultation
struct ScriptedPolicy {
    delays: Mutex<VecDeque<Option<Duration>>>,
    consulted: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedPolicy {
    fn new(script: Vec<Option<Duration>>) -> (Box<Self>, Arc<Mutex<Vec<u32>>>) {
        let consulted = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                delays: Mutex::new(script.into()),
                consulted: Arc::clone(&consulted),
            }),
            consulted,
        )
    }
}

impl ReconnectPolicy for ScriptedPolicy {
    fn next_delay(&self, ctx: &ReconnectContext) -> roomlink_webrtc::Result<Option<Duration>> {
        self.consulted.lock().push(ctx.retry_count);
        Ok(self.delays.lock().pop_front().unwrap_or(None))
    }
}

fn test_options() -> EngineOptions {
    let mut options = EngineOptions::default();
    options.signal.connect_timeout = Duration::from_secs(5);
    options.negotiation_timeout = Duration::from_secs(10);
    options.transport_timeout = Duration::from_secs(15);
    options
}

async fn next_event(events: &mut EngineEvents, timeout: Duration) -> EngineEvent {
    tokio::time::timeout(timeout, events.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("event stream closed")
}

/// Drain events until one matches, returning everything seen on the way
async fn wait_for_event<F>(
    events: &mut EngineEvents,
    timeout: Duration,
    predicate: F,
) -> Vec<EngineEvent>
where
    F: Fn(&EngineEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| {
                panic!("timed out waiting for event, saw: {seen:?}");
            });
        let event = next_event(events, remaining).await;
        let matched = predicate(&event);
        seen.push(event);
        if matched {
            return seen;
        }
    }
}

async fn wait_transports_connected(engine: &SessionEngine, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(coordinator) = engine.coordinator() {
            if coordinator.aggregate_state() == TransportState::Connected {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "transports never reached connected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_connect_surfaces_session_events() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        ..Default::default()
    })
    .await;

    let (engine, mut events) =
        SessionEngine::connect(&server.url(), "tok", test_options()).await.unwrap();

    assert_eq!(engine.phase(), SessionPhase::Connected);
    let first = next_event(&mut events, Duration::from_secs(1)).await;
    assert!(matches!(first, EngineEvent::Connected));

    server.send(roomlink_core::SignalResponse::Update(ParticipantUpdate {
        participants: vec![test_participant("PA_2")],
    }));
    let seen = wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, EngineEvent::ParticipantUpdate(update)
            if update.participants[0].sid == "PA_2")
    })
    .await;
    assert!(!seen.is_empty());

    server.send(roomlink_core::SignalResponse::RoomUpdate(RoomUpdate {
        room: RoomInfo {
            sid: "RM_test".to_string(),
            name: "renamed".to_string(),
            metadata: String::new(),
        },
    }));
    wait_for_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, EngineEvent::RoomUpdate(update) if update.room.name == "renamed")
    })
    .await;

    engine.close().await;
    assert_eq!(engine.phase(), SessionPhase::Closed);

    let said_goodbye = server
        .wait_for_request(Duration::from_secs(2), |req| {
            matches!(req, SignalRequest::Leave(leave)
                if leave.action == LeaveAction::Disconnect)
        })
        .await;
    assert!(said_goodbye, "close should send a leave request");
}

#[tokio::test]
async fn test_publisher_primary_sends_initial_offer() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(false, 0, 0)),
        ..Default::default()
    })
    .await;

    let mut options = test_options();
    options.negotiation_timeout = Duration::from_millis(500);

    let (engine, _events) =
        SessionEngine::connect(&server.url(), "tok", options).await.unwrap();

    let offered = server
        .wait_for_request(Duration::from_secs(3), |req| {
            matches!(req, SignalRequest::Offer(_))
        })
        .await;
    assert!(offered, "publisher-primary sessions offer immediately");

    engine.close().await;
}

#[tokio::test]
async fn test_add_track_resolves_on_matching_ack() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        ..Default::default()
    })
    .await;

    let (engine, _events) =
        SessionEngine::connect(&server.url(), "tok", test_options()).await.unwrap();
    let engine = Arc::new(engine);

    let publishing = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .add_track(AddTrackRequest {
                    cid: "abc".to_string(),
                    name: "mic".to_string(),
                    kind: TrackKind::Audio,
                    muted: false,
                    width: 0,
                    height: 0,
                })
                .await
        })
    };

    let requested = server
        .wait_for_request(Duration::from_secs(2), |req| {
            matches!(req, SignalRequest::AddTrack(r) if r.cid == "abc")
        })
        .await;
    assert!(requested);

    server.send(roomlink_core::SignalResponse::TrackPublished(
        TrackPublished {
            cid: "abc".to_string(),
            track: TrackInfo {
                sid: "TR_abc".to_string(),
                name: "mic".to_string(),
                kind: TrackKind::Audio,
                muted: false,
            },
        },
    ));

    let info = publishing.await.unwrap().unwrap();
    assert_eq!(info.sid, "TR_abc");

    engine.close().await;
}

#[tokio::test]
async fn test_add_track_duplicate_and_cancellation() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        ..Default::default()
    })
    .await;

    let (engine, _events) =
        SessionEngine::connect(&server.url(), "tok", test_options()).await.unwrap();
    let engine = Arc::new(engine);

    let request = AddTrackRequest {
        cid: "dup".to_string(),
        name: "cam".to_string(),
        kind: TrackKind::Video,
        muted: false,
        width: 1280,
        height: 720,
    };

    let first = {
        let engine = Arc::clone(&engine);
        let request = request.clone();
        tokio::spawn(async move { engine.add_track(request).await })
    };

    // Wait until the first publish is registered, then a duplicate must
    // reject synchronously
    server
        .wait_for_request(Duration::from_secs(2), |req| {
            matches!(req, SignalRequest::AddTrack(r) if r.cid == "dup")
        })
        .await;
    let duplicate = engine.add_track(request).await;
    assert!(matches!(duplicate, Err(Error::Internal(_))));

    // Cancellation rejects the pending wait without another round trip
    engine.remove_track("dup");
    let cancelled = first.await.unwrap();
    assert!(matches!(cancelled, Err(Error::Cancelled(_))), "got {cancelled:?}");

    engine.close().await;
}

#[tokio::test]
async fn test_add_track_times_out_without_ack() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        ..Default::default()
    })
    .await;

    let mut options = test_options();
    options.publish_timeout = Duration::from_millis(300);

    let (engine, _events) =
        SessionEngine::connect(&server.url(), "tok", options).await.unwrap();

    let err = engine
        .add_track(AddTrackRequest {
            cid: "never".to_string(),
            name: "cam".to_string(),
            kind: TrackKind::Video,
            muted: false,
            width: 640,
            height: 480,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err}");

    engine.close().await;
}

#[tokio::test]
async fn test_backoff_script_runs_to_terminal_disconnect() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        media: true,
        ..Default::default()
    })
    .await;

    let (policy, consulted) = ScriptedPolicy::new(vec![
        Some(Duration::from_millis(10)),
        Some(Duration::from_millis(20)),
        None,
    ]);

    let (engine, mut events) = SessionEngine::connect_with(
        &server.url(),
        "tok",
        test_options(),
        policy,
        None,
    )
    .await
    .unwrap();

    wait_transports_connected(&engine, Duration::from_secs(10)).await;

    // Take the server away entirely: every reconnect attempt must fail
    server.shutdown();

    let seen = wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, EngineEvent::Disconnected { .. })
    })
    .await;

    // Resume was attempted first, then the escalated full restart, then
    // the policy said stop
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::Resuming)));
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::Restarting)));
    assert!(!seen.iter().any(|e| matches!(e, EngineEvent::Resumed)));
    assert!(!seen.iter().any(|e| matches!(e, EngineEvent::Restarted)));

    assert_eq!(*consulted.lock(), vec![0, 1, 2]);

    // No further attempts after the terminal event; the engine settles in
    // its terminal phase once teardown finishes
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*consulted.lock(), vec![0, 1, 2]);
    assert_eq!(engine.phase(), SessionPhase::Disconnected);
}

#[tokio::test]
async fn test_resume_keeps_transports_and_replays_state() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        reconnect_payload: Some(ReconnectPayload {
            ice_servers: vec![],
            client_configuration: None,
        }),
        media: true,
        ..Default::default()
    })
    .await;

    let (policy, _consulted) = ScriptedPolicy::new(vec![
        Some(Duration::from_millis(50)),
        Some(Duration::from_millis(50)),
        None,
    ]);

    let (engine, mut events) = SessionEngine::connect_with(
        &server.url(),
        "tok",
        test_options(),
        policy,
        None,
    )
    .await
    .unwrap();

    wait_transports_connected(&engine, Duration::from_secs(10)).await;

    // Sever only the signaling channel; the media transports stay up
    server.drop_connection();

    let seen = wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, EngineEvent::Resumed)
    })
    .await;

    assert!(seen.iter().any(|e| matches!(e, EngineEvent::Resuming)));
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::SignalResumed)));
    assert!(!seen.iter().any(|e| matches!(e, EngineEvent::Restarting)));

    // The reconnect handshake used the resume path and replayed state
    let queries = server.queries();
    assert!(queries[1].contains("reconnect=1"));
    assert!(queries[1].contains("sid=PA_local"));
    let synced = server
        .wait_for_request(Duration::from_secs(2), |req| {
            matches!(req, SignalRequest::SyncState(_))
        })
        .await;
    assert!(synced, "resume should replay a session snapshot");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.phase(), SessionPhase::Connected);
    engine.close().await;
}

#[tokio::test]
async fn test_server_leave_forces_immediate_full_restart() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        media: true,
        ..Default::default()
    })
    .await;

    // A long scripted delay proves the leave collapses it to zero
    let (policy, _consulted) = ScriptedPolicy::new(vec![
        Some(Duration::from_secs(30)),
        None,
    ]);

    let (engine, mut events) = SessionEngine::connect_with(
        &server.url(),
        "tok",
        test_options(),
        policy,
        None,
    )
    .await
    .unwrap();

    wait_transports_connected(&engine, Duration::from_secs(10)).await;

    server.send(roomlink_core::SignalResponse::Leave(Leave {
        action: LeaveAction::Reconnect,
        reason: "node draining".to_string(),
    }));

    let seen = wait_for_event(&mut events, Duration::from_secs(15), |event| {
        matches!(event, EngineEvent::Restarted)
    })
    .await;

    assert!(seen.iter().any(|e| matches!(e, EngineEvent::Restarting)));
    assert!(seen.iter().any(|e| matches!(e, EngineEvent::SignalRestarted)));
    assert!(!seen.iter().any(|e| matches!(e, EngineEvent::Resuming)));

    // The rejoin was a fresh join, not a resume handshake
    assert_eq!(server.connection_count(), 2);
    assert!(!server.queries()[1].contains("reconnect=1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.phase(), SessionPhase::Connected);
    engine.close().await;
}

#[tokio::test]
async fn test_data_packet_round_trip() {
    let server = MockSignalServer::spawn(ServerConfig {
        join: Some(test_join(true, 0, 0)),
        media: true,
        ..Default::default()
    })
    .await;

    let (engine, mut events) =
        SessionEngine::connect(&server.url(), "tok", test_options()).await.unwrap();

    wait_transports_connected(&engine, Duration::from_secs(10)).await;

    // Server to client over the reliable subscriber channel
    let inbound = DataPacket {
        participant_sid: "PA_2".to_string(),
        payload: b"hello from server".to_vec(),
        topic: Some("chat".to_string()),
    };
    let peer = server.media_peer().expect("media peer");
    peer.send_reliable(bincode::serialize(&inbound).unwrap()).await;

    wait_for_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, EngineEvent::DataReceived { packet, kind }
            if packet.payload == inbound.payload && *kind == DataPacketKind::Reliable)
    })
    .await;

    // Client to server: lazily brings the publisher up, then delivers
    let outbound = DataPacket {
        participant_sid: "PA_local".to_string(),
        payload: b"hello from client".to_vec(),
        topic: None,
    };
    engine
        .send_data_packet(outbound.clone(), DataPacketKind::Reliable)
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let received = peer.received_data.lock().clone();
        if received
            .iter()
            .any(|data| bincode::deserialize::<DataPacket>(data).ok().as_ref() == Some(&outbound))
        {
            break;
        }
        assert!(Instant::now() < deadline, "server never saw the packet");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(engine.is_buffer_low(DataPacketKind::Reliable));
    engine.close().await;
}
