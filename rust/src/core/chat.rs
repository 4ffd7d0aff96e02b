use cove_crypto::{RoomCipher, RoomKey};
use tracing::{debug, info, warn};

use super::signal::{parse_signal, BusEvent, StoredMessage, Subscription};
use super::AppCore;
use crate::state::{now_seconds, ChatMessage, MessageDeliveryState, RoomView};
use crate::updates::{CoreMsg, InternalEvent};

/// A joined room: the derived key, the message cipher, and the live bus
/// subscription. Dropping the session unsubscribes.
pub(super) struct RoomSession {
    pub(super) key: RoomKey,
    cipher: RoomCipher,
    _subscription: Subscription,
}

impl AppCore {
    pub(super) fn handle_join_room_action(&mut self, name: &str, pin: &str) {
        let display = name.trim();
        if display.is_empty() || pin.trim().is_empty() {
            self.toast("Room name and PIN are required");
            return;
        }
        // Leaving the previous room also tears down any call in it.
        self.handle_leave_room_action();

        let key = RoomKey::derive(name, pin);
        let cipher = RoomCipher::new(pin, &key);

        let (subscription, receiver) = self.bus.subscribe(&key);
        let forward_key = key.clone();
        let tx = self.core_sender.clone();
        // Forward bus events into the actor loop. The thread exits when
        // either side of the pair disconnects.
        std::thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                let forwarded = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Bus {
                    room_key: forward_key.clone(),
                    event,
                })));
                if forwarded.is_err() {
                    break;
                }
            }
        });

        let my_id = self.state.participant_id.clone();
        let mut messages: Vec<ChatMessage> = Vec::new();
        for stored in self.bus.history(&key) {
            // The feed is at-least-once; the log itself may repeat ids.
            if messages.iter().any(|m| m.id == stored.id) {
                continue;
            }
            messages.push(decrypted_message(&cipher, &my_id, stored));
        }

        info!(room = %key, history = messages.len(), "joined room");
        self.state.room = Some(RoomView {
            room_key: key.to_string(),
            name: display.to_string(),
            messages,
        });
        self.room = Some(RoomSession {
            key,
            cipher,
            _subscription: subscription,
        });
        self.emit_state();
    }

    pub(super) fn handle_leave_room_action(&mut self) {
        if self.room.is_none() {
            return;
        }
        self.cleanup_call();
        if let Some(session) = self.room.take() {
            info!(room = %session.key, "left room");
        }
        self.state.room = None;
        self.emit_state();
    }

    pub(super) fn handle_send_message_action(&mut self, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        let Some(session) = self.room.as_ref() else {
            self.toast("Join a room first");
            return;
        };

        let stored = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.state.participant_id.clone(),
            sender_name: self.state.display_name.clone(),
            body: session.cipher.encrypt(content),
            timestamp: now_seconds(),
        };

        // Optimistic append; delivery state settles when the publish
        // result comes back.
        let local = ChatMessage {
            id: stored.id.clone(),
            sender_id: stored.sender_id.clone(),
            sender_name: stored.sender_name.clone(),
            content: content.to_string(),
            timestamp: stored.timestamp,
            is_mine: true,
            delivery: MessageDeliveryState::Pending,
        };

        let bus = self.bus.clone();
        let room_key = session.key.clone();
        let tx = self.core_sender.clone();
        let message_id = stored.id.clone();
        self.runtime.spawn(async move {
            let result = bus.post_message(&room_key, stored);
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::PublishMessageResult {
                    message_id,
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                },
            )));
        });

        if let Some(view) = self.state.room.as_mut() {
            view.messages.push(local);
        }
        self.emit_state();
    }

    pub(super) fn handle_bus_event(&mut self, room_key: &RoomKey, event: BusEvent) {
        // Events from a room we have since left are stale.
        if self.room.as_ref().map(|s| &s.key) != Some(room_key) {
            debug!(room = %room_key, "event for inactive room dropped");
            return;
        }
        match event {
            BusEvent::Signal(payload) => {
                let Some(msg) = parse_signal(&payload) else {
                    debug!("unparseable signal dropped");
                    return;
                };
                if msg.from == self.state.participant_id {
                    return;
                }
                if let Some(to) = msg.to.as_deref() {
                    if to != self.state.participant_id {
                        return;
                    }
                }
                self.handle_call_signal(msg);
            }
            BusEvent::Message(stored) => {
                if stored.sender_id == self.state.participant_id {
                    // Already present from the optimistic append.
                    return;
                }
                // Delivery is at-least-once, and a post can race the
                // history snapshot taken on join. Dedup by id.
                let already_known = self
                    .state
                    .room
                    .as_ref()
                    .is_some_and(|view| view.messages.iter().any(|m| m.id == stored.id));
                if already_known {
                    debug!(message_id = %stored.id, "redelivered message dropped");
                    return;
                }
                let my_id = self.state.participant_id.clone();
                let message = match self.room.as_ref() {
                    Some(session) => decrypted_message(&session.cipher, &my_id, stored),
                    None => return,
                };
                if let Some(view) = self.state.room.as_mut() {
                    view.messages.push(message);
                }
                self.emit_state();
            }
        }
    }

    pub(super) fn handle_publish_result(
        &mut self,
        message_id: &str,
        ok: bool,
        error: Option<String>,
    ) {
        let Some(view) = self.state.room.as_mut() else {
            return;
        };
        let Some(message) = view.messages.iter_mut().find(|m| m.id == message_id) else {
            return;
        };
        message.delivery = if ok {
            MessageDeliveryState::Sent
        } else {
            let reason = error.unwrap_or_else(|| "relay unavailable".to_string());
            warn!(%message_id, %reason, "message publish failed");
            MessageDeliveryState::Failed {
                reason: reason.clone(),
            }
        };
        if !ok {
            self.toast("Message failed to send");
        }
        self.emit_state();
    }
}

/// Decrypt never fails: undecipherable bodies surface as the sentinel
/// text so one bad message cannot poison the room history.
fn decrypted_message(cipher: &RoomCipher, my_id: &str, stored: StoredMessage) -> ChatMessage {
    ChatMessage {
        is_mine: stored.sender_id == my_id,
        content: cipher.decrypt(&stored.body),
        id: stored.id,
        sender_id: stored.sender_id,
        sender_name: stored.sender_name,
        timestamp: stored.timestamp,
        delivery: MessageDeliveryState::Sent,
    }
}
