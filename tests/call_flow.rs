//! End-to-end call flows over the in-process relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use peercall::media::testing::StaticMediaBackend;
use peercall::test_relay::RelayHub;
use peercall::{
    CallConfig, CallError, CallEvent, CallSessionCoordinator, CallState, RelayMessage,
    SignalPayload, SwitchOutcome, TrackKind, UserId,
};

struct Party {
    coordinator: Arc<CallSessionCoordinator>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    backend: Arc<StaticMediaBackend>,
}

fn connect(hub: &RelayHub, name: &str, config: CallConfig) -> Party {
    let (client, relay_rx) = hub.register(UserId::from(name));
    let backend = Arc::new(StaticMediaBackend::new());
    let (coordinator, events) =
        CallSessionCoordinator::new(UserId::from(name), config, client, backend.clone());
    coordinator.attach_relay_events(relay_rx);
    Party {
        coordinator,
        events,
        backend,
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_until<F>(what: &str, mut cond: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), deadline)
        .await
        .is_err()
    {
        panic!("timed out waiting for {what}");
    }
}

async fn next_event_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<CallEvent>,
    what: &str,
    mut pred: F,
) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    let search = async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), search).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

async fn establish_call(alice: &mut Party, bob: &mut Party) {
    alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
    next_event_matching(&mut bob.events, "incoming call", |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    bob.coordinator.accept_call().await.unwrap();
    wait_until("both sides active", async || {
        alice.coordinator.state().await == CallState::Active
            && bob.coordinator.state().await == CallState::Active
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn call_accept_establishes_session() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());

    establish_call(&mut alice, &mut bob).await;

    // The caller's offer only exists once the callee has accepted.
    let log = hub.messages();
    let accept_index = log
        .iter()
        .position(|(_, _, m)| matches!(m, RelayMessage::AnswerCall { .. }))
        .expect("accept in relay log");
    let offer_index = log
        .iter()
        .position(|(_, _, m)| {
            matches!(
                m,
                RelayMessage::SendingSignal {
                    signal: SignalPayload::Offer { .. }
                }
            )
        })
        .expect("offer in relay log");
    assert!(accept_index < offer_index);

    wait_until("answer reaches the caller", async || {
        hub.sent_to(&UserId::from("alice")).iter().any(|m| {
            matches!(
                m,
                RelayMessage::SendingSignal {
                    signal: SignalPayload::Answer { .. }
                }
            )
        })
    })
    .await;

    assert!(alice.coordinator.active_engine().await.is_some());
    assert!(bob.coordinator.active_engine().await.is_some());

    alice.coordinator.hang_up().await.unwrap();
    wait_until("both sides idle", async || {
        alice.coordinator.state().await == CallState::Idle
            && bob.coordinator.state().await == CallState::Idle
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_starts_redial_cooldown() {
    init_logging();
    let hub = RelayHub::new();
    let config = CallConfig {
        cooldown: Duration::from_millis(300),
        ..CallConfig::default()
    };
    let alice = connect(&hub, "alice", config);
    let _bob = connect(&hub, "bob", CallConfig::default());

    alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
    assert_eq!(alice.coordinator.state().await, CallState::Calling);
    alice.coordinator.cancel_call().await.unwrap();
    assert_eq!(alice.coordinator.state().await, CallState::Idle);
    assert!(
        hub.sent_to(&UserId::from("bob"))
            .iter()
            .any(|m| matches!(m, RelayMessage::HangUp))
    );

    // Immediate redial is refused, a later one is not.
    let err = alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Cooldown));
    tokio::time::sleep(Duration::from_millis(400)).await;
    alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_call_times_out() {
    init_logging();
    let hub = RelayHub::new();
    let alice = connect(&hub, "alice", CallConfig::default());
    let bob = connect(
        &hub,
        "bob",
        CallConfig {
            ring_timeout: Duration::from_millis(200),
            ..CallConfig::default()
        },
    );

    alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
    wait_until("ring timeout fires", async || {
        bob.coordinator.state().await == CallState::Idle
            && alice.coordinator.state().await == CallState::Idle
    })
    .await;
    assert!(
        hub.sent_to(&UserId::from("alice"))
            .iter()
            .any(|m| matches!(m, RelayMessage::RejectCall))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reject_returns_both_sides_to_idle() {
    init_logging();
    let hub = RelayHub::new();
    let alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());

    alice
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
    next_event_matching(&mut bob.events, "incoming call", |e| {
        matches!(e, CallEvent::IncomingCall { .. })
    })
    .await;
    bob.coordinator.reject_call().await.unwrap();
    wait_until("both sides idle", async || {
        alice.coordinator.state().await == CallState::Idle
            && bob.coordinator.state().await == CallState::Idle
    })
    .await;
    assert!(bob.coordinator.active_engine().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_ops_outside_their_state_are_noops() {
    init_logging();
    let hub = RelayHub::new();
    let alice = connect(&hub, "alice", CallConfig::default());

    alice.coordinator.accept_call().await.unwrap();
    alice.coordinator.reject_call().await.unwrap();
    alice.coordinator.hang_up().await.unwrap();
    alice.coordinator.cancel_call().await.unwrap();
    assert_eq!(alice.coordinator.state().await, CallState::Idle);
    assert!(hub.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn incoming_call_while_busy_is_ignored() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    let charlie = connect(&hub, "charlie", CallConfig::default());

    establish_call(&mut alice, &mut bob).await;
    charlie
        .coordinator
        .initiate_call(UserId::from("bob"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.coordinator.state().await, CallState::Active);
    let intent = bob.coordinator.intent().await.expect("intent");
    assert_eq!(intent.peer, UserId::from("alice"));
}

#[tokio::test(flavor = "multi_thread")]
async fn screen_share_round_trip() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    let share = bob.coordinator.screen_share().await.expect("active call");
    share.start_share().await.unwrap();
    let event = next_event_matching(&mut alice.events, "share start", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { .. })
    })
    .await;
    assert!(matches!(
        event,
        CallEvent::RemoteScreenShareChanged { sharing: true }
    ));

    // Camera switches are refused while the share owns the video sender.
    let devices = bob.coordinator.device_manager().await.expect("active call");
    let err = devices
        .switch_video_input(&"usb-cam".into())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::SwitchDuringShare));
    // A second share on the same call is refused too.
    assert!(share.start_share().await.is_err());

    share.stop_share().await.unwrap();
    let event = next_event_matching(&mut alice.events, "share stop", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { .. })
    })
    .await;
    assert!(matches!(
        event,
        CallEvent::RemoteScreenShareChanged { sharing: false }
    ));
    // Camera restored; switching works again.
    devices.switch_video_input(&"usb-cam".into()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn external_share_end_restores_camera() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    let share = bob.coordinator.screen_share().await.expect("active call");
    share.start_share().await.unwrap();
    next_event_matching(&mut alice.events, "share start", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { sharing: true })
    })
    .await;

    // The user kills the capture from the OS picker.
    bob.backend.end_screen_share();
    next_event_matching(&mut alice.events, "share stop", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { sharing: false })
    })
    .await;
    wait_until("local share state cleared", async || !share.is_sharing()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn device_switch_falls_back_to_default() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    let devices = bob.coordinator.device_manager().await.expect("active call");
    let outcome = devices.switch_video_input(&"usb-cam".into()).await.unwrap();
    assert_eq!(outcome, SwitchOutcome::Switched);

    bob.backend.set_failing("usb-cam");
    let outcome = devices.switch_video_input(&"usb-cam".into()).await.unwrap();
    assert_eq!(outcome, SwitchOutcome::FellBackToDefault);
    assert!(!devices.is_unavailable(TrackKind::Video));

    // Default gone too: the video line goes silent and the kind is
    // flagged unavailable.
    bob.backend.set_failing("default-cam");
    let err = devices
        .switch_video_input(&"usb-cam".into())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::DeviceUnavailable(TrackKind::Video)));
    assert!(devices.is_unavailable(TrackKind::Video));
    let engine = bob.coordinator.active_engine().await.expect("engine");
    assert!(engine.outgoing_track(TrackKind::Video).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn share_state_survives_handle_drop() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    {
        let share = bob.coordinator.screen_share().await.expect("active call");
        share.start_share().await.unwrap();
    }
    next_event_matching(&mut alice.events, "share start", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { sharing: true })
    })
    .await;

    // The app dropped its handle; the coordinator's per-call instance
    // still owns the share, so the external end is handled normally.
    bob.backend.end_screen_share();
    next_event_matching(&mut alice.events, "share stop", |e| {
        matches!(e, CallEvent::RemoteScreenShareChanged { sharing: false })
    })
    .await;

    let share = bob.coordinator.screen_share().await.expect("active call");
    wait_until("share state cleared", async || !share.is_sharing()).await;
    // The video sender is free again.
    let devices = bob.coordinator.device_manager().await.expect("active call");
    devices.switch_video_input(&"usb-cam".into()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn per_call_surfaces_are_stable_across_fetches() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    let first = bob.coordinator.device_manager().await.expect("active call");
    let second = bob.coordinator.device_manager().await.expect("active call");
    assert!(Arc::ptr_eq(&first, &second));

    // Bookkeeping on the surface is visible through a later fetch.
    bob.backend.set_failing("usb-cam");
    bob.backend.set_failing("default-cam");
    let err = first
        .switch_video_input(&"usb-cam".into())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::DeviceUnavailable(TrackKind::Video)));
    drop(first);
    let refetched = bob.coordinator.device_manager().await.expect("active call");
    assert!(refetched.is_unavailable(TrackKind::Video));

    bob.coordinator.hang_up().await.unwrap();
    wait_until("surfaces cleared after hangup", async || {
        bob.coordinator.device_manager().await.is_none()
            && bob.coordinator.screen_share().await.is_none()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mute_toggles_track_without_release() {
    init_logging();
    let hub = RelayHub::new();
    let mut alice = connect(&hub, "alice", CallConfig::default());
    let mut bob = connect(&hub, "bob", CallConfig::default());
    establish_call(&mut alice, &mut bob).await;

    let engine = bob.coordinator.active_engine().await.expect("engine");
    engine
        .set_track_enabled(TrackKind::Audio, false)
        .await
        .unwrap();
    let track = engine
        .outgoing_track(TrackKind::Audio)
        .await
        .expect("audio track");
    assert!(!track.is_enabled());
    assert!(!track.is_stopped());
    engine
        .set_track_enabled(TrackKind::Audio, true)
        .await
        .unwrap();
    assert!(track.is_enabled());
}
