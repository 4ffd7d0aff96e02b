use cove_media::{MediaKind, VoiceFilterMode};

#[derive(Debug, Clone)]
pub enum AppAction {
    // Room
    JoinRoom {
        name: String,
        pin: String,
    },
    LeaveRoom,
    SendMessage {
        content: String,
    },

    // Calls
    StartCall {
        target_id: String,
        target_name: String,
        target_avatar: Option<String>,
        media_kind: MediaKind,
    },
    AnswerCall,
    RejectCall,
    Hangup,

    // In-call controls
    ToggleMute,
    ToggleCamera,
    SwitchCamera,
    SetVoiceFilter {
        mode: VoiceFilterMode,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes secrets like the room PIN).
    pub fn tag(&self) -> &'static str {
        match self {
            // Room
            AppAction::JoinRoom { .. } => "JoinRoom",
            AppAction::LeaveRoom => "LeaveRoom",
            AppAction::SendMessage { .. } => "SendMessage",

            // Calls
            AppAction::StartCall { .. } => "StartCall",
            AppAction::AnswerCall => "AnswerCall",
            AppAction::RejectCall => "RejectCall",
            AppAction::Hangup => "Hangup",

            // In-call controls
            AppAction::ToggleMute => "ToggleMute",
            AppAction::ToggleCamera => "ToggleCamera",
            AppAction::SwitchCamera => "SwitchCamera",
            AppAction::SetVoiceFilter { .. } => "SetVoiceFilter",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}
