use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cove_crypto::RoomKey;
use cove_media::{IceCandidate, MediaKind, SessionDescription};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SIGNAL_NS: &str = "cove.call";
pub const SIGNAL_VERSION: u8 = 1;

/// One call-signaling message as exchanged over the relay.
///
/// Broadcast per room; a `to` of `Some(participant)` means every other
/// subscriber ignores it, which is how two independent 1:1 calls coexist
/// on a shared room channel. Consumers also suppress their own echoes
/// (`from == self`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub call_id: String,
    pub from: String,
    pub from_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub body: SignalBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalBody {
    Offer {
        description: SessionDescription,
        media: MediaKind,
        #[serde(default)]
        ice_restart: bool,
    },
    Answer {
        description: SessionDescription,
    },
    Candidate {
        candidate: IceCandidate,
    },
    Reject {
        reason: RejectReason,
    },
    Bye,
}

impl SignalBody {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBody::Offer { .. } => "offer",
            SignalBody::Answer { .. } => "answer",
            SignalBody::Candidate { .. } => "candidate",
            SignalBody::Reject { .. } => "reject",
            SignalBody::Bye => "bye",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    Declined,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignalEnvelope {
    v: u8,
    ns: String,
    #[serde(flatten)]
    msg: SignalMessage,
}

pub fn encode_signal(msg: &SignalMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&SignalEnvelope {
        v: SIGNAL_VERSION,
        ns: SIGNAL_NS.to_string(),
        msg: msg.clone(),
    })
}

/// Parses a relay payload into a signal. Unknown versions, foreign
/// namespaces, and malformed JSON all come back as `None` and are
/// dropped by the consumer.
pub fn parse_signal(content: &str) -> Option<SignalMessage> {
    let env: SignalEnvelope = serde_json::from_str(content).ok()?;
    if env.v != SIGNAL_VERSION || env.ns != SIGNAL_NS {
        return None;
    }
    Some(env.msg)
}

/// A message body as persisted in the room feed. `body` is the sealed
/// envelope (or a legacy payload); the bus never sees plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Raw signal payload; consumers run it through [`parse_signal`].
    Signal(String),
    Message(StoredMessage),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("signal encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus connection closed")]
    Closed,
}

/// The relay contract the call state machine and the chat path depend
/// on: at-least-once delivery, ordered per room. Self-echo suppression
/// and `to`-addressing are the consumer's job.
pub trait SignalBus: Send + Sync {
    /// Ephemeral broadcast of an encoded signal to the room.
    fn send_signal(&self, room: &RoomKey, payload: String) -> Result<(), BusError>;

    /// Durable append to the room feed, then broadcast.
    fn post_message(&self, room: &RoomKey, message: StoredMessage) -> Result<(), BusError>;

    /// Full stored feed, in append order.
    fn history(&self, room: &RoomKey) -> Vec<StoredMessage>;

    /// Register for room deliveries. Unsubscribes when the returned
    /// guard is dropped.
    fn subscribe(&self, room: &RoomKey) -> (Subscription, flume::Receiver<BusEvent>);
}

pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription{..}")
    }
}

/// In-process bus: per-room subscriber registry plus a durable message
/// log behind one mutex. Used by the default runtime wiring and by every
/// test; a deployment would put a real relay behind the same trait.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    rooms: HashMap<String, RoomChannel>,
    next_sub_id: u64,
}

#[derive(Default)]
struct RoomChannel {
    subscribers: Vec<(u64, flume::Sender<BusEvent>)>,
    log: Vec<StoredMessage>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast(&self, room: &RoomKey, event: BusEvent) {
        let mut inner = self.lock();
        if let Some(channel) = inner.rooms.get_mut(room.as_str()) {
            channel
                .subscribers
                .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }
}

impl SignalBus for InMemoryBus {
    fn send_signal(&self, room: &RoomKey, payload: String) -> Result<(), BusError> {
        self.broadcast(room, BusEvent::Signal(payload));
        Ok(())
    }

    fn post_message(&self, room: &RoomKey, message: StoredMessage) -> Result<(), BusError> {
        {
            let mut inner = self.lock();
            inner
                .rooms
                .entry(room.as_str().to_string())
                .or_default()
                .log
                .push(message.clone());
        }
        self.broadcast(room, BusEvent::Message(message));
        Ok(())
    }

    fn history(&self, room: &RoomKey) -> Vec<StoredMessage> {
        let inner = self.lock();
        inner
            .rooms
            .get(room.as_str())
            .map(|channel| channel.log.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self, room: &RoomKey) -> (Subscription, flume::Receiver<BusEvent>) {
        let (tx, rx) = flume::unbounded();
        let sub_id = {
            let mut inner = self.lock();
            let sub_id = inner.next_sub_id;
            inner.next_sub_id += 1;
            inner
                .rooms
                .entry(room.as_str().to_string())
                .or_default()
                .subscribers
                .push((sub_id, tx));
            sub_id
        };

        let bus = self.clone();
        let room_id = room.as_str().to_string();
        let subscription = Subscription::new(move || {
            let mut inner = bus.lock();
            if let Some(channel) = inner.rooms.get_mut(&room_id) {
                channel.subscribers.retain(|(id, _)| *id != sub_id);
            }
        });
        (subscription, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_media::SdpKind;

    fn offer_msg() -> SignalMessage {
        SignalMessage {
            call_id: "call-1".into(),
            from: "alice".into(),
            from_name: "Alice".into(),
            from_avatar: None,
            to: Some("bob".into()),
            body: SignalBody::Offer {
                description: SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "loopback:offer:g0:x".into(),
                },
                media: MediaKind::Audio,
                ice_restart: false,
            },
        }
    }

    #[test]
    fn signal_roundtrips_through_the_envelope() {
        let msg = offer_msg();
        let wire = encode_signal(&msg).unwrap();
        assert_eq!(parse_signal(&wire), Some(msg));
    }

    #[test]
    fn foreign_namespace_and_version_are_dropped() {
        let wire = encode_signal(&offer_msg()).unwrap();
        let bumped = wire.replace("\"v\":1", "\"v\":2");
        assert!(parse_signal(&bumped).is_none());
        let renamed = wire.replace("cove.call", "other.ns");
        assert!(parse_signal(&renamed).is_none());
        assert!(parse_signal(r#"{"foo":"bar"}"#).is_none());
        assert!(parse_signal("not json").is_none());
    }

    #[test]
    fn ice_restart_defaults_to_false_when_absent() {
        let wire = encode_signal(&offer_msg()).unwrap();
        assert!(wire.contains("\"ice_restart\":false"));
        let stripped = wire.replace(",\"ice_restart\":false", "");
        match parse_signal(&stripped) {
            Some(SignalMessage {
                body: SignalBody::Offer { ice_restart, .. },
                ..
            }) => assert!(!ice_restart),
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_reaches_all_room_subscribers() {
        let bus = InMemoryBus::new();
        let room = RoomKey::derive("harbor", "4242");
        let (_sub_a, rx_a) = bus.subscribe(&room);
        let (_sub_b, rx_b) = bus.subscribe(&room);

        bus.send_signal(&room, "payload".into()).unwrap();
        assert!(matches!(rx_a.try_recv(), Ok(BusEvent::Signal(p)) if p == "payload"));
        assert!(matches!(rx_b.try_recv(), Ok(BusEvent::Signal(p)) if p == "payload"));

        // Other rooms hear nothing.
        let other = RoomKey::derive("harbor", "0000");
        bus.send_signal(&other, "elsewhere".into()).unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn dropping_the_subscription_stops_delivery() {
        let bus = InMemoryBus::new();
        let room = RoomKey::derive("harbor", "4242");
        let (sub, rx) = bus.subscribe(&room);
        drop(sub);
        bus.send_signal(&room, "payload".into()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn history_is_durable_for_late_joiners() {
        let bus = InMemoryBus::new();
        let room = RoomKey::derive("harbor", "4242");
        for n in 0..3 {
            bus.post_message(
                &room,
                StoredMessage {
                    id: format!("m{n}"),
                    sender_id: "alice".into(),
                    sender_name: "Alice".into(),
                    body: format!("sealed-{n}"),
                    timestamp: n,
                },
            )
            .unwrap();
        }
        let log = bus.history(&room);
        let ids: Vec<&str> = log.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }
}
