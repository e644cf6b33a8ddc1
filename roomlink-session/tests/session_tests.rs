//! End-to-end session tests against the in-memory signaling server
//!
//! Run with: cargo test --test session_tests

use roomlink_session::loopback::{LoopbackAudio, LoopbackMediaDevices, LoopbackRoom, LoopbackSfu};
use roomlink_session::signaling::{CONSUME, CREATE_TRANSPORT, PRODUCE, RTP_CAPABILITIES};
use roomlink_session::{
    Config, ConnectionState, Error, LocalUser, MediaBackends, MediaKind, ResolutionTier, Session,
    SessionEvent, SessionPhase, TelemetrySnapshot,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn config() -> Config {
    let mut config = Config::default();
    config.media.camera_settle_delay_ms = 0;
    config.stats.interval_ms = 50;
    config
}

fn participant(room: &LoopbackRoom) -> Session {
    Session::new(config(), room.backends())
}

/// Poll `check` until it holds, failing after five seconds
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("expected session event")
}

fn track_count(session: &Session) -> usize {
    session
        .peers()
        .first()
        .and_then(|view| view.stream.as_ref().map(|s| s.len()))
        .unwrap_or(0)
}

#[tokio::test]
async fn test_second_participant_is_assembled_and_removed() {
    let room = LoopbackRoom::new();
    let alice = participant(&room);
    let bob = participant(&room);
    let mut alice_events = alice.events();

    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Producing);
    assert_eq!(alice.producer_count(), 2);
    assert!(alice.peers().is_empty());

    bob.join("room-1", LocalUser::new("u2", "Bob")).await.unwrap();

    // Bob admitted Alice from the join acknowledgment before join resolved
    let bob_view = bob.peers();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].user_name, "Alice");
    assert_eq!(bob_view[0].stream.as_ref().map(|s| s.len()), Some(2));

    // Alice learns about Bob through two newConsumer pushes
    eventually("Bob's two tracks at Alice", || track_count(&alice) == 2).await;
    let views = alice.peers();
    assert_eq!(views.len(), 1);
    let bob_at_alice = &views[0];
    assert_eq!(bob_at_alice.user_id.as_str(), "u2");
    assert_eq!(bob_at_alice.user_name, "Bob");
    let mut kinds = bob_at_alice.kinds();
    kinds.sort();
    assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    let bob_peer_id = bob_at_alice.peer_id.clone();
    let bob_tracks = bob_at_alice
        .stream
        .as_ref()
        .map(|s| s.tracks().to_vec())
        .unwrap_or_default();

    next_event(&mut alice_events, |e| matches!(e, SessionEvent::PeerJoined { .. })).await;

    bob.leave().await.unwrap();
    assert_eq!(bob.connection_state(), ConnectionState::Idle);

    let left = next_event(&mut alice_events, |e| matches!(e, SessionEvent::PeerLeft { .. })).await;
    assert_eq!(left, SessionEvent::PeerLeft { peer_id: bob_peer_id.clone() });
    assert!(alice.peers().is_empty());
    assert!(alice.peer(&bob_peer_id).is_none());
    assert!(bob_tracks.iter().all(|t| !t.is_live()));
    assert!(!alice.telemetry().borrow().peers.contains_key(&bob_peer_id));

    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_new_consumer_is_dropped() {
    let room = LoopbackRoom::new();
    room.duplicate_new_consumer(true);
    let alice = participant(&room);
    let bob = participant(&room);

    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    bob.join("room-1", LocalUser::new("u2", "Bob")).await.unwrap();

    eventually("Bob's tracks at Alice", || track_count(&alice) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(track_count(&alice), 2);
    // Two consumes per side, none for the duplicates
    assert_eq!(room.request_count(CONSUME), 4);
    // One send transport each plus one receive transport each
    assert_eq!(room.request_count(CREATE_TRANSPORT), 4);

    bob.leave().await.unwrap();
    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_negotiation_failure_tears_down() {
    let room = LoopbackRoom::new();
    room.fail_event(PRODUCE);
    let devices = Arc::new(LoopbackMediaDevices::standard());
    let session = Session::new(config(), room.backends_with(devices.clone()));
    let mut events = session.events();

    let result = session.join("room-1", LocalUser::new("u1", "Alice")).await;
    assert!(matches!(result, Err(Error::Negotiation(_))));

    assert_eq!(session.connection_state(), ConnectionState::Idle);
    assert_eq!(session.phase(), SessionPhase::Terminated);
    assert_eq!(session.producer_count(), 0);
    assert_eq!(devices.live_tracks(), 0);

    let fatal = next_event(&mut events, SessionEvent::is_fatal).await;
    assert!(matches!(fatal, SessionEvent::Error { .. }));

    // Departure is still announced
    eventually("room emptied", || room.members("room-1").is_empty()).await;
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let room = LoopbackRoom::new();
    room.ignore_event(CREATE_TRANSPORT);
    let mut config = config();
    config.signaling.request_timeout_ms = 200;
    let session = Session::new(config, room.backends());

    let result = session.join("room-1", LocalUser::new("u1", "Alice")).await;
    assert!(matches!(
        result,
        Err(Error::SignalingTimeout {
            event: "create-web-rtc-transport",
            timeout_ms: 200
        })
    ));
    assert_eq!(session.connection_state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_missing_capabilities_times_out() {
    let room = LoopbackRoom::new();
    room.withhold_capabilities(true);
    let mut config = config();
    config.signaling.request_timeout_ms = 200;
    let session = Session::new(config, room.backends());

    let result = session.join("room-1", LocalUser::new("u1", "Alice")).await;
    assert!(matches!(
        result,
        Err(Error::SignalingTimeout { event, .. }) if event == RTP_CAPABILITIES
    ));
    assert_eq!(session.phase(), SessionPhase::Terminated);
}

#[tokio::test]
async fn test_camera_switch_replaces_track_in_place() {
    let room = LoopbackRoom::new();
    let session = participant(&room);
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

    let producer = session.producer_id(MediaKind::Video).unwrap();
    let before = session.sending_track(MediaKind::Video).unwrap();
    assert_eq!(before.device_id(), Some("cam-1"));

    session.switch_camera("cam-2").await.unwrap();

    let after = session.sending_track(MediaKind::Video).unwrap();
    assert_eq!(after.device_id(), Some("cam-2"));
    assert!(!before.is_live());
    assert_eq!(session.producer_id(MediaKind::Video), Some(producer));
    assert_eq!(session.producer_count(), 2);
    assert_eq!(session.selection().await.resolution(), ResolutionTier::P180);
    assert_eq!(room.request_count(CREATE_TRANSPORT), 1);
    assert_eq!(room.request_count(PRODUCE), 2);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_failed_camera_switch_is_recoverable() {
    let room = LoopbackRoom::new();
    let session = participant(&room);
    let mut events = session.events();
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

    let result = session.switch_camera("missing").await;
    assert!(matches!(result, Err(Error::DeviceUnavailable(_))));

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(!event.is_fatal());
    assert_eq!(session.connection_state(), ConnectionState::Joined);
    let local = session.local_stream().await.unwrap();
    assert!(local.track(MediaKind::Video).is_some_and(|t| t.is_live()));

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_rejected_camera_track_rolls_back_to_previous_camera() {
    let room = LoopbackRoom::new();
    let sfu = Arc::new(LoopbackSfu::new());
    let backends = MediaBackends {
        sfu: sfu.clone(),
        ..room.backends()
    };
    let session = Session::new(config(), backends);
    let mut events = session.events();
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    let producer = session.producer_id(MediaKind::Video);
    let camera = session.selection().await.camera_id;

    sfu.reject_next_replacement();
    let result = session.switch_camera("cam-2").await;
    assert!(matches!(result, Err(Error::Negotiation(_))));

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(!event.is_fatal());

    // The producer sends the reopened previous camera, the same track the local stream shows
    let sending = session.sending_track(MediaKind::Video).unwrap();
    assert!(sending.is_live());
    assert_eq!(sending.device_id(), Some("cam-1"));
    let local = session.local_stream().await.unwrap();
    assert_eq!(local.track(MediaKind::Video).unwrap().id(), sending.id());
    assert_eq!(session.selection().await.camera_id, camera);
    assert_eq!(session.producer_id(MediaKind::Video), producer);
    assert_eq!(session.connection_state(), ConnectionState::Joined);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_rejected_resolution_track_keeps_previous_tier() {
    let room = LoopbackRoom::new();
    let sfu = Arc::new(LoopbackSfu::new());
    let backends = MediaBackends {
        sfu: sfu.clone(),
        ..room.backends()
    };
    let session = Session::new(config(), backends);
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    let before = session.selection().await.resolution();
    let width = session.sending_track(MediaKind::Video).unwrap().settings().width;

    sfu.reject_next_replacement();
    let result = session.change_resolution(ResolutionTier::P720).await;
    assert!(matches!(result, Err(Error::Negotiation(_))));

    let sending = session.sending_track(MediaKind::Video).unwrap();
    assert!(sending.is_live());
    assert_eq!(sending.settings().width, width);
    assert_eq!(session.selection().await.resolution(), before);
    let local = session.local_stream().await.unwrap();
    assert_eq!(local.track(MediaKind::Video).unwrap().id(), sending.id());

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_microphone_switch_keeps_processed_track() {
    let room = LoopbackRoom::new();
    let session = participant(&room);
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    let sending = session.sending_track(MediaKind::Audio).unwrap();

    session.switch_microphone("mic-2").await.unwrap();

    let after = session.sending_track(MediaKind::Audio).unwrap();
    assert_eq!(after.id(), sending.id());
    assert_eq!(session.selection().await.mic_id.as_deref(), Some("mic-2"));

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_resolution_change_while_joined() {
    let room = LoopbackRoom::new();
    let session = participant(&room);
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    let producer = session.producer_id(MediaKind::Video);

    session.change_resolution(ResolutionTier::P720).await.unwrap();

    let track = session.sending_track(MediaKind::Video).unwrap();
    assert_eq!(track.settings().width, Some(1280));
    assert_eq!(session.producer_id(MediaKind::Video), producer);

    session.leave().await.unwrap();
}

#[tokio::test]
async fn test_telemetry_reports_bitrate_after_baseline() {
    let room = LoopbackRoom::new();
    let alice = participant(&room);
    let bob = participant(&room);
    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    bob.join("room-1", LocalUser::new("u2", "Bob")).await.unwrap();
    eventually("Bob's tracks at Alice", || track_count(&alice) == 2).await;

    let telemetry = alice.telemetry();
    eventually("outbound and inbound bitrate", || {
        let snapshot = telemetry.borrow();
        snapshot.outbound.video.bitrate_kbps.is_available()
            && snapshot
                .peers
                .values()
                .any(|peer| peer.video.bitrate_kbps.is_available())
    })
    .await;

    let snapshot = telemetry.borrow().clone();
    assert!(snapshot.outbound.video.bitrate_kbps.get().unwrap_or(-1.0) >= 0.0);
    assert_eq!(snapshot.outbound.video.loss_percent.get(), Some(0.0));
    assert!(snapshot.outbound.rtt_ms.get().is_some_and(|rtt| (rtt - 12.0).abs() < 1e-6));

    bob.leave().await.unwrap();
    alice.leave().await.unwrap();
    assert_eq!(*telemetry.borrow(), TelemetrySnapshot::default());
}

#[tokio::test]
async fn test_signaling_loss_is_fatal() {
    let room = LoopbackRoom::new();
    let session = participant(&room);
    let mut events = session.events();
    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

    let peer_id = room.members("room-1").pop().unwrap();
    room.disconnect(&peer_id).await;

    next_event(&mut events, SessionEvent::is_fatal).await;
    eventually("idle after signaling loss", || {
        session.connection_state() == ConnectionState::Idle
    })
    .await;
    assert_eq!(session.phase(), SessionPhase::Terminated);
    assert_eq!(session.producer_count(), 0);
}

#[tokio::test]
async fn test_leave_during_join_discards_late_results() {
    let room = LoopbackRoom::new();
    room.ignore_event(CONSUME);
    let alice = participant(&room);
    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

    // Bob's join blocks on consuming Alice's producers
    let bob = Arc::new(participant(&room));
    let joining = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.join("room-1", LocalUser::new("u2", "Bob")).await })
    };
    eventually("Bob producing", || bob.phase() == SessionPhase::Producing).await;

    bob.leave().await.unwrap();
    let result = joining.await.unwrap();
    assert!(matches!(result, Err(Error::SessionLeft)));
    assert_eq!(bob.connection_state(), ConnectionState::Idle);
    assert!(bob.peers().is_empty());
    assert_eq!(bob.producer_count(), 0);

    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_failed_consume_is_isolated_to_the_peer() {
    let room = LoopbackRoom::new();
    let alice = participant(&room);
    let bob = participant(&room);
    let mut alice_events = alice.events();
    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();

    room.fail_event(CONSUME);
    bob.join("room-1", LocalUser::new("u2", "Bob")).await.unwrap();
    assert_eq!(bob.connection_state(), ConnectionState::Joined);
    assert_eq!(bob.phase(), SessionPhase::Producing);

    let event = next_event(&mut alice_events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(!event.is_fatal());
    assert_eq!(alice.connection_state(), ConnectionState::Joined);
    assert_eq!(alice.phase(), SessionPhase::Producing);
    assert_eq!(alice.producer_count(), 2);
    assert_eq!(track_count(&alice), 0);

    bob.leave().await.unwrap();
    alice.leave().await.unwrap();
}

#[tokio::test]
async fn test_remote_audio_is_routed_through_speaker_gain() {
    let room = LoopbackRoom::new();
    let audio = Arc::new(LoopbackAudio::new());
    let backends = MediaBackends {
        audio: audio.clone(),
        ..room.backends()
    };
    let alice = Session::new(config(), backends);
    let bob = participant(&room);
    alice.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    bob.join("room-1", LocalUser::new("u2", "Bob")).await.unwrap();

    eventually("Bob's audio routed at Alice", || {
        alice.peers().first().is_some_and(|view| view.mute_element)
    })
    .await;
    assert_eq!(track_count(&alice), 2);
    // Microphone chain plus Bob's speaker chain, each in its own context
    assert_eq!(audio.open_contexts(), 2);
    assert_eq!(audio.active_taps(), 2);
    assert_eq!(audio.gain_nodes_created(), 2);

    alice.set_speaker_gain(0.5);
    assert!((audio.last_gain_values()[1] - 0.5).abs() < f32::EPSILON);
    alice.set_speaker_enabled(false);
    assert!(audio.last_gain_values()[1].abs() < f32::EPSILON);
    alice.set_speaker_enabled(true);
    assert!((audio.last_gain_values()[1] - 0.5).abs() < f32::EPSILON);

    bob.leave().await.unwrap();
    eventually("Bob's speaker chain detached", || audio.active_taps() == 1).await;

    alice.leave().await.unwrap();
    assert_eq!(audio.open_contexts(), 0);
}

#[tokio::test]
async fn test_gain_toggle_restores_level() {
    let room = LoopbackRoom::new();
    let session = participant(&room);

    session.set_mic_gain(2.0);
    session.set_mic_enabled(false);
    assert!(session.mic_gain().effective().abs() < f32::EPSILON);
    session.set_mic_enabled(true);
    assert!((session.mic_gain().effective() - 2.0).abs() < f32::EPSILON);

    session.set_speaker_gain(0.4);
    session.set_speaker_enabled(false);
    session.set_speaker_enabled(true);
    assert!((session.speaker_gain().level() - 0.4).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_device_controls_before_join() {
    let room = LoopbackRoom::new();
    let devices = Arc::new(LoopbackMediaDevices::standard());
    let session = Session::new(config(), room.backends_with(devices.clone()));
    let mut events = session.events();

    let inventory = session.refresh_devices().await.unwrap();
    assert_eq!(inventory.cameras.len(), 2);
    assert_eq!(inventory.speakers.len(), 1);

    session.select_speaker(Some("speaker-1".to_string())).await.unwrap();
    session.switch_camera("cam-2").await.unwrap();
    assert_eq!(session.selection().await.camera_id.as_deref(), Some("cam-2"));
    assert!(session.local_stream().await.is_none());

    let preview = session.start_preview().await.unwrap();
    assert_eq!(
        preview.track(MediaKind::Video).and_then(|t| t.device_id()),
        Some("cam-2")
    );

    session.join("room-1", LocalUser::new("u1", "Alice")).await.unwrap();
    devices.notify_change();
    next_event(&mut events, |e| matches!(e, SessionEvent::DevicesChanged)).await;
    assert_eq!(session.selection().await.speaker_id.as_deref(), Some("speaker-1"));

    session.leave().await.unwrap();
}
