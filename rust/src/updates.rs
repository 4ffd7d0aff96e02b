use cove_crypto::RoomKey;
use cove_media::{EndpointEvent, TransportStats};

use crate::core::signal::BusEvent;
use crate::state::AppState;
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

#[derive(Debug)]
pub enum InternalEvent {
    /// Relay delivery for a room subscription (signal or stored message).
    Bus { room_key: RoomKey, event: BusEvent },

    /// Transport endpoint notification, tagged with the call it belongs
    /// to so events from an already-abandoned call are ignored.
    Endpoint {
        call_id: String,
        event: EndpointEvent,
    },

    /// Periodic sample from the capture worker. Carries transport stats
    /// and doubles as the reconnect watchdog tick.
    CallTick {
        call_id: String,
        stats: TransportStats,
    },

    /// Off-actor message publish result.
    PublishMessageResult {
        message_id: String,
        ok: bool,
        error: Option<String>,
    },

    Toast(String),
}
