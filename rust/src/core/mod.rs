mod call;
mod call_runtime;
mod chat;
mod config;
mod ringer;
pub mod signal;

use std::sync::{Arc, RwLock};

use flume::Sender;

use cove_media::MediaConnector;

use crate::actions::AppAction;
use crate::state::AppState;
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use call::{ActiveCall, PendingIncoming};
use chat::RoomSession;
use ringer::Ringer;
use signal::SignalBus;

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    bus: Arc<dyn SignalBus>,
    media: Arc<dyn MediaConnector>,

    room: Option<RoomSession>,
    active_call: Option<ActiveCall>,
    pending_incoming: Option<PendingIncoming>,
    ringer: Ringer,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        bus: Arc<dyn SignalBus>,
        media: Arc<dyn MediaConnector>,
        shared_state: Arc<RwLock<AppState>>,
    ) -> Self {
        let config = config::load_app_config(&data_dir);

        let participant_id = uuid::Uuid::new_v4().to_string();
        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| format!("guest-{}", &participant_id[..8]));
        let state = AppState::empty(participant_id, display_name, config.avatar_url.clone());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("tokio runtime");

        let this = Self {
            state,
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            bus,
            media,
            room: None,
            active_call: None,
            pending_incoming: None,
            ringer: Ringer::default(),
        };

        // Ensure App.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep the toast in state until the UI explicitly clears it, so a
        // state() resync still shows it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain the room PIN.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::JoinRoom { name, pin } => self.handle_join_room_action(&name, &pin),
            AppAction::LeaveRoom => self.handle_leave_room_action(),
            AppAction::SendMessage { content } => self.handle_send_message_action(&content),
            AppAction::StartCall {
                target_id,
                target_name,
                target_avatar,
                media_kind,
            } => self.handle_start_call_action(&target_id, &target_name, target_avatar, media_kind),
            AppAction::AnswerCall => self.handle_answer_call_action(),
            AppAction::RejectCall => self.handle_reject_call_action(),
            AppAction::Hangup => self.handle_hangup_action(),
            AppAction::ToggleMute => self.handle_toggle_mute_action(),
            AppAction::ToggleCamera => self.handle_toggle_camera_action(),
            AppAction::SwitchCamera => self.handle_switch_camera_action(),
            AppAction::SetVoiceFilter { mode } => self.handle_set_voice_filter_action(mode),
            AppAction::ClearToast => {
                if self.state.toast.take().is_some() {
                    self.emit_state();
                }
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::Bus { room_key, event } => self.handle_bus_event(&room_key, event),
            InternalEvent::Endpoint { call_id, event } => {
                self.handle_endpoint_event(&call_id, event)
            }
            InternalEvent::CallTick { call_id, stats } => self.handle_call_tick(&call_id, stats),
            InternalEvent::PublishMessageResult {
                message_id,
                ok,
                error,
            } => self.handle_publish_result(&message_id, ok, error),
            InternalEvent::Toast(msg) => {
                tracing::info!(msg, "toast");
                self.toast(msg);
            }
        }
    }
}
