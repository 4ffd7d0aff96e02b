use cove_media::{MediaKind, VoiceFilterMode};

#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub participant_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub room: Option<RoomView>,
    pub active_call: Option<CallSnapshot>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty(participant_id: String, display_name: String, avatar_url: Option<String>) -> Self {
        Self {
            rev: 0,
            participant_id,
            display_name,
            avatar_url,
            room: None,
            active_call: None,
            toast: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoomView {
    pub room_key: String,
    pub name: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: i64,
    pub is_mine: bool,
    pub delivery: MessageDeliveryState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Calling,
    Incoming,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteParty {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
}

/// UI-facing view of the active call. Replaced wholesale on every
/// transition so observers never see a half-applied state; `None` on
/// `AppState::active_call` is the Idle phase.
#[derive(Clone, Debug)]
pub struct CallSnapshot {
    pub call_id: String,
    pub phase: CallPhase,
    pub is_initiator: bool,
    pub remote: RemoteParty,
    pub media_kind: MediaKind,
    pub is_muted: bool,
    pub is_camera_enabled: bool,
    pub voice_filter: VoiceFilterMode,
    pub stats: CallStats,
}

impl CallSnapshot {
    pub fn new(
        call_id: String,
        phase: CallPhase,
        is_initiator: bool,
        remote: RemoteParty,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            call_id,
            phase,
            is_initiator,
            remote,
            media_kind,
            is_muted: false,
            // Video calls start with the camera on; audio calls have none.
            is_camera_enabled: media_kind == MediaKind::Video,
            voice_filter: VoiceFilterMode::Normal,
            stats: CallStats::default(),
        }
    }
}

pub fn now_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_call_snapshot_starts_with_camera_enabled() {
        let remote = RemoteParty {
            id: "p1".into(),
            name: "peer".into(),
            avatar: None,
        };
        let video = CallSnapshot::new(
            "c1".into(),
            CallPhase::Calling,
            true,
            remote.clone(),
            MediaKind::Video,
        );
        assert!(video.is_camera_enabled);

        let audio = CallSnapshot::new("c2".into(), CallPhase::Calling, true, remote, MediaKind::Audio);
        assert!(!audio.is_camera_enabled);
        assert!(!audio.is_muted);
        assert_eq!(audio.voice_filter, VoiceFilterMode::Normal);
    }
}
