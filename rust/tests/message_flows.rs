mod support;

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cove_core::{
    AppAction, BusError, BusEvent, InMemoryBus, MessageDeliveryState, RoomKey, SignalBus,
    StoredMessage, Subscription, DECRYPT_SENTINEL,
};
use cove_media::LoopbackFabric;

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

fn messages(client: &TestClient) -> Vec<(String, String)> {
    client
        .app
        .state()
        .room
        .map(|room| {
            room.messages
                .into_iter()
                .map(|m| (m.sender_name, m.content))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn messages_roundtrip_between_room_members() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "4242");

    alice.app.dispatch(AppAction::SendMessage {
        content: "ahoy from alice".to_string(),
    });
    wait_until("bob sees the message", Duration::from_secs(5), || {
        messages(&bob).contains(&("alice".to_string(), "ahoy from alice".to_string()))
    });
    wait_until("alice's copy is marked sent", Duration::from_secs(5), || {
        alice
            .app
            .state()
            .room
            .is_some_and(|room| {
                room.messages
                    .iter()
                    .any(|m| m.is_mine && m.delivery == MessageDeliveryState::Sent)
            })
    });

    // The room log never holds plaintext.
    let key = RoomKey::derive("harbor", "4242");
    for stored in bus.history(&key) {
        assert!(!stored.body.contains("ahoy"));
        assert!(stored.body.contains(':'));
    }
}

#[test]
fn same_name_different_pin_is_a_different_room() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    let bob = spawn_client(&bus, &fabric, "bob");
    join(&alice, "harbor", "4242");
    join(&bob, "harbor", "9999");

    alice.app.dispatch(AppAction::SendMessage {
        content: "secret".to_string(),
    });
    wait_until("alice's copy lands", Duration::from_secs(5), || {
        !messages(&alice).is_empty()
    });
    std::thread::sleep(Duration::from_millis(300));
    assert!(messages(&bob).is_empty());
}

#[test]
fn late_joiner_decrypts_history_and_tolerates_bad_bodies() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let key = RoomKey::derive("harbor", "4242");

    // Pre-encryption history: bare base64 of the plaintext.
    bus.post_message(
        &key,
        StoredMessage {
            id: "legacy-1".to_string(),
            sender_id: "old-client".to_string(),
            sender_name: "oldtimer".to_string(),
            body: BASE64.encode("plain old message"),
            timestamp: 1,
        },
    )
    .unwrap();
    // A mangled envelope must surface as the sentinel, not an error.
    bus.post_message(
        &key,
        StoredMessage {
            id: "corrupt-1".to_string(),
            sender_id: "old-client".to_string(),
            sender_name: "oldtimer".to_string(),
            body: "00112233445566778899aabbccddeeff:!!!notbase64".to_string(),
            timestamp: 2,
        },
    )
    .unwrap();

    let alice = spawn_client(&bus, &fabric, "alice");
    join(&alice, "harbor", "4242");
    alice.app.dispatch(AppAction::SendMessage {
        content: "fresh".to_string(),
    });
    wait_until("alice's copy lands", Duration::from_secs(5), || {
        messages(&alice).len() == 3
    });

    let bob = spawn_client(&bus, &fabric, "bob");
    join(&bob, "harbor", "4242");
    let history = messages(&bob);
    assert_eq!(
        history,
        vec![
            ("oldtimer".to_string(), "plain old message".to_string()),
            ("oldtimer".to_string(), DECRYPT_SENTINEL.to_string()),
            ("alice".to_string(), "fresh".to_string()),
        ]
    );
}

#[test]
fn redelivered_stored_message_lands_once() {
    let bus = InMemoryBus::new();
    let fabric = LoopbackFabric::new();
    let alice = spawn_client(&bus, &fabric, "alice");
    join(&alice, "harbor", "4242");

    let key = RoomKey::derive("harbor", "4242");
    let stored = StoredMessage {
        id: "msg-1".to_string(),
        sender_id: "peer".to_string(),
        sender_name: "peer".to_string(),
        body: BASE64.encode("once is enough"),
        timestamp: 1,
    };
    // At-least-once delivery: the relay may hand the same message over
    // more than once.
    bus.post_message(&key, stored.clone()).unwrap();
    bus.post_message(&key, stored).unwrap();

    wait_until("message arrives", Duration::from_secs(5), || {
        !messages(&alice).is_empty()
    });
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        messages(&alice),
        vec![("peer".to_string(), "once is enough".to_string())]
    );
}

/// Relay double that accepts subscriptions but refuses every publish.
#[derive(Clone)]
struct FailingBus {
    inner: InMemoryBus,
}

impl SignalBus for FailingBus {
    fn send_signal(&self, room: &RoomKey, payload: String) -> Result<(), BusError> {
        self.inner.send_signal(room, payload)
    }

    fn post_message(&self, _room: &RoomKey, _message: StoredMessage) -> Result<(), BusError> {
        Err(BusError::Closed)
    }

    fn history(&self, room: &RoomKey) -> Vec<StoredMessage> {
        self.inner.history(room)
    }

    fn subscribe(&self, room: &RoomKey) -> (Subscription, flume::Receiver<BusEvent>) {
        self.inner.subscribe(room)
    }
}

#[test]
fn failed_publish_marks_the_message_and_toasts() {
    let fabric = LoopbackFabric::new();
    let data_dir = tempfile::tempdir().unwrap();
    let app = cove_core::App::new(
        data_dir.path().to_string_lossy().into_owned(),
        std::sync::Arc::new(FailingBus {
            inner: InMemoryBus::new(),
        }),
        std::sync::Arc::new(fabric.connector("alice")),
    );

    app.dispatch(AppAction::JoinRoom {
        name: "harbor".to_string(),
        pin: "4242".to_string(),
    });
    wait_until("room joined", Duration::from_secs(5), || {
        app.state().room.is_some()
    });

    app.dispatch(AppAction::SendMessage {
        content: "into the void".to_string(),
    });
    wait_until("delivery marked failed", Duration::from_secs(5), || {
        let state = app.state();
        let failed = state.room.as_ref().is_some_and(|room| {
            room.messages
                .iter()
                .any(|m| matches!(m.delivery, MessageDeliveryState::Failed { .. }))
        });
        failed && state.toast.as_deref() == Some("Message failed to send")
    });
}
