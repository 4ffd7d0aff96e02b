mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cove_core::{AppAction, AppReconciler, AppUpdate, CallPhase, InMemoryBus};
use cove_media::{LoopbackFabric, MediaKind, VoiceFilterMode};

use support::{spawn_client, wait_until, TestClient};

fn join(client: &TestClient, name: &str, pin: &str) {
    client.app.dispatch(AppAction::JoinRoom {
        name: name.to_string(),
        pin: pin.to_string(),
    });
    wait_until("room joined", Duration::from_secs(5), || {
        client.app.state().room.is_some()
    });
}

fn phase(client: &TestClient) -> Option<CallPhase> {
    client.app.state().active_call.map(|c| c.phase)
}

fn call(caller: &TestClient, callee: &TestClient, media_kind: MediaKind) {
    let target = callee.app.state();
    caller.app.dispatch(AppAction::StartCall {
        target_id: target.participant_id.clone(),
        target_name: target.display_name.clone(),
        target_avatar: None,
        media_kind,
    });
}

fn connect_pair(caller: &TestClient, callee: &TestClient, media_kind: MediaKind) {
    call(caller, callee, media_kind);
    wait_until("caller ringing out", Duration::from_secs(5), || {
        phase(caller) == Some(CallPhase::Calling)
    });
    wait_until("callee ringing in", Duration::from_secs(5), || {
        phase(callee) == Some(CallPhase::Incoming)
    });
    callee.app.dispatch(AppAction::AnswerCall);
    wait_until("caller connected", Duration::from_secs(5), || {
        phase(caller) == Some(CallPhase::Connected)
    });
    wait_until("callee connected", Duration::from_secs(5), || {
        phase(callee) == Some(CallPhase::Connected)
    });
}

/// Records the call phase of every state rev so tests can assert on
/// transitions too short-lived for a snapshot poller to catch.
struct PhaseRecorder {
    phases: Arc<Mutex<Vec<Option<CallPhase>>>>,
}

impl PhaseRecorder {
    fn new() -> (Self, Arc<Mutex<Vec<Option<CallPhase>>>>) {
        let phases = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                phases: phases.clone(),
            },
            phases,
        )
    }
}

impl AppReconciler for PhaseRecorder {
    fn reconcile(&self, update: AppUpdate) {
        let AppUpdate::FullState(state) = update;
        self.phases
            .lock()
            .unwrap()
            .push(state.active_call.map(|c| c.phase));
    }
}

#[test]
fn audio_call_full_lifecycle() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    connect_pair(&alice, &bob, MediaKind::Audio);

    // Media flows both ways once linked.
    wait_until("frames flowing", Duration::from_secs(5), || {
        let stats = alice.app.state().active_call.map(|c| c.stats);
        stats.is_some_and(|s| s.tx_frames > 0 && s.rx_frames > 0)
    });

    alice.app.dispatch(AppAction::Hangup);
    wait_until("caller idle", Duration::from_secs(5), || {
        phase(&alice).is_none()
    });
    wait_until("callee idle", Duration::from_secs(5), || {
        phase(&bob).is_none()
    });
    wait_until("capture released", Duration::from_secs(5), || {
        fabric.all_tracks_released()
    });
}

#[test]
fn reject_leaves_both_sides_idle_with_toast() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    call(&alice, &bob, MediaKind::Audio);
    wait_until("callee ringing in", Duration::from_secs(5), || {
        phase(&bob) == Some(CallPhase::Incoming)
    });

    bob.app.dispatch(AppAction::RejectCall);
    wait_until("callee idle", Duration::from_secs(5), || phase(&bob).is_none());
    wait_until("caller idle with decline toast", Duration::from_secs(5), || {
        let state = alice.app.state();
        state.active_call.is_none()
            && state.toast.as_deref() == Some("Call declined")
    });
}

#[test]
fn third_caller_gets_busy_and_existing_call_is_untouched() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    let carol = spawn_client(&bus, &fabric, "carol");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");
    join(&carol, "harbor", "4242");

    connect_pair(&alice, &bob, MediaKind::Audio);

    call(&carol, &bob, MediaKind::Audio);
    wait_until("intruder bounced", Duration::from_secs(5), || {
        let state = carol.app.state();
        state.active_call.is_none() && state.toast.as_deref() == Some("Peer is busy")
    });
    // The live call never noticed.
    assert_eq!(phase(&bob), Some(CallPhase::Connected));
    assert_eq!(phase(&alice), Some(CallPhase::Connected));
}

#[test]
fn two_calls_in_one_room_run_independently() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    let carol = spawn_client(&bus, &fabric, "carol");
    let dave = spawn_client(&bus, &fabric, "dave");
    for client in [&alice, &bob, &carol, &dave] {
        join(client, "harbor", "4242");
    }

    connect_pair(&alice, &bob, MediaKind::Audio);
    connect_pair(&carol, &dave, MediaKind::Audio);

    // Each call linked to its own peer, not across calls.
    let bob_id = bob.app.state().participant_id;
    let dave_id = dave.app.state().participant_id;
    let alice_call = alice.app.state().active_call.unwrap();
    let carol_call = carol.app.state().active_call.unwrap();
    assert_eq!(alice_call.remote.id, bob_id);
    assert_eq!(carol_call.remote.id, dave_id);
    assert_ne!(alice_call.call_id, carol_call.call_id);

    wait_until("frames on both calls", Duration::from_secs(5), || {
        let flowing = |client: &TestClient| {
            client
                .app
                .state()
                .active_call
                .is_some_and(|c| c.stats.tx_frames > 0 && c.stats.rx_frames > 0)
        };
        flowing(&alice) && flowing(&carol)
    });

    // Ending one call leaves the other untouched.
    alice.app.dispatch(AppAction::Hangup);
    wait_until("first pair idle", Duration::from_secs(5), || {
        phase(&alice).is_none() && phase(&bob).is_none()
    });
    assert_eq!(phase(&carol), Some(CallPhase::Connected));
    assert_eq!(phase(&dave), Some(CallPhase::Connected));
}

#[test]
fn trickled_candidates_apply_in_arrival_order() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    connect_pair(&alice, &bob, MediaKind::Audio);
    wait_until("candidates applied", Duration::from_secs(5), || {
        fabric.applied_candidates("bob").len() >= 2
    });

    let applied = fabric.applied_candidates("bob");
    assert!(applied[0].candidate.starts_with("candidate:loopback 0"));
    assert!(applied[1].candidate.starts_with("candidate:loopback 1"));
}

#[test]
fn transport_loss_reconnects_via_ice_restart() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    connect_pair(&alice, &bob, MediaKind::Audio);

    // Recovery completes in well under one poll interval on the
    // loopback fabric, so the transient Reconnecting phase has to be
    // observed through the update stream, not polled snapshots.
    let (recorder, phases) = PhaseRecorder::new();
    alice.app.listen_for_updates(Box::new(recorder));

    fabric.sever();
    // The initiator's automatic restart offer renegotiates the link.
    wait_until("caller dipped and recovered", Duration::from_secs(5), || {
        let seen = phases.lock().unwrap();
        seen.contains(&Some(CallPhase::Reconnecting))
            && seen.last() == Some(&Some(CallPhase::Connected))
    });
    wait_until("callee recovered", Duration::from_secs(5), || {
        phase(&bob) == Some(CallPhase::Connected)
    });
}

#[test]
fn reconnect_window_expiry_drops_the_call() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    connect_pair(&alice, &bob, MediaKind::Audio);

    // Leaving the room tears the callee's call down without signaling, so
    // the initiator's restart offer goes unanswered.
    bob.app.dispatch(AppAction::LeaveRoom);
    wait_until("callee left", Duration::from_secs(5), || {
        bob.app.state().room.is_none()
    });
    wait_until("caller reconnecting", Duration::from_secs(5), || {
        phase(&alice) == Some(CallPhase::Reconnecting)
    });
    // reconnect_timeout_secs is 2 in the test config.
    wait_until("call dropped after timeout", Duration::from_secs(10), || {
        let state = alice.app.state();
        state.active_call.is_none()
            && state.toast.as_deref() == Some("Call dropped: connection did not recover")
    });
}

#[test]
fn mute_and_voice_filter_apply_only_while_connected() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    call(&alice, &bob, MediaKind::Audio);
    wait_until("caller ringing out", Duration::from_secs(5), || {
        phase(&alice) == Some(CallPhase::Calling)
    });
    // Controls are refused outside Connected.
    alice.app.dispatch(AppAction::ToggleMute);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        alice.app.state().active_call.map(|c| c.is_muted),
        Some(false)
    );

    bob.app.dispatch(AppAction::AnswerCall);
    wait_until("caller connected", Duration::from_secs(5), || {
        phase(&alice) == Some(CallPhase::Connected)
    });

    alice.app.dispatch(AppAction::ToggleMute);
    wait_until("mute reaches the track", Duration::from_secs(5), || {
        fabric.track_enabled("alice", MediaKind::Audio) == Some(false)
            && alice.app.state().active_call.map(|c| c.is_muted) == Some(true)
    });

    alice.app.dispatch(AppAction::SetVoiceFilter {
        mode: VoiceFilterMode::Robot,
    });
    wait_until("filter snapshot updated", Duration::from_secs(5), || {
        alice.app.state().active_call.map(|c| c.voice_filter) == Some(VoiceFilterMode::Robot)
    });

    alice.app.dispatch(AppAction::ToggleMute);
    wait_until("unmuted again", Duration::from_secs(5), || {
        fabric.track_enabled("alice", MediaKind::Audio) == Some(true)
    });
}

#[test]
fn denied_capture_surfaces_a_toast_and_stays_idle() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    fabric.deny_media(true);
    call(&alice, &bob, MediaKind::Audio);
    wait_until("denied toast", Duration::from_secs(5), || {
        let state = alice.app.state();
        state.active_call.is_none()
            && state.toast.as_deref() == Some("Microphone/camera access denied")
    });
}
