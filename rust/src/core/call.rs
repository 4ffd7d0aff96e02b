use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use cove_media::{
    ConnectionState, EndpointEvent, EventSink, IceCandidate, LocalTracks, MediaEndpoint,
    MediaError, MediaKind, SessionDescription, TransportStats, VoiceFilterMode,
};
use tracing::{debug, info, warn};

use super::call_runtime::CaptureWorker;
use super::signal::{RejectReason, SignalBody, SignalMessage};
use super::AppCore;
use crate::state::{CallPhase, CallSnapshot, CallStats, RemoteParty};
use crate::updates::{CoreMsg, InternalEvent};

/// Live resources for the call in progress. Owned exclusively by the
/// core actor; dropping it releases everything (capture tracks, the
/// transport, the audio pump), which is what makes cleanup idempotent.
pub(super) struct ActiveCall {
    pub(super) call_id: String,
    is_initiator: bool,
    remote: RemoteParty,
    media_kind: MediaKind,
    endpoint: Arc<dyn MediaEndpoint>,
    tracks: LocalTracks,
    worker: CaptureWorker,
    // Candidates waiting for a remote description. Applied FIFO.
    candidates: VecDeque<IceCandidate>,
    reconnect_since: Option<Instant>,
    restart_sent: bool,
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.tracks.stop();
        self.endpoint.close();
        self.worker.stop();
    }
}

/// An offer we are ringing on but have not answered yet. No transport
/// exists at this point, so early candidates queue here.
pub(super) struct PendingIncoming {
    call_id: String,
    from: RemoteParty,
    description: SessionDescription,
    media_kind: MediaKind,
    candidates: VecDeque<IceCandidate>,
}

impl AppCore {
    fn call_phase(&self) -> Option<CallPhase> {
        self.state.active_call.as_ref().map(|c| c.phase)
    }

    fn outgoing_signal(&self, call_id: &str, to: &str, body: SignalBody) -> SignalMessage {
        SignalMessage {
            call_id: call_id.to_string(),
            from: self.state.participant_id.clone(),
            from_name: self.state.display_name.clone(),
            from_avatar: self.state.avatar_url.clone(),
            to: Some(to.to_string()),
            body,
        }
    }

    /// Send synchronously from the actor so signals leave in the order
    /// the state machine produced them. A relay failure is reported but
    /// does not abort the call: upstream retry may still deliver.
    fn send_call_signal(&mut self, msg: SignalMessage) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let room_key = room.key.clone();
        let kind = msg.body.kind();
        let encoded = match super::signal::encode_signal(&msg) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind, err = %e, "signal encode failed");
                return;
            }
        };
        if let Err(e) = self.bus.send_signal(&room_key, encoded) {
            warn!(kind, err = %e, "signal send failed");
            self.toast(format!("Signal delivery failed: {e}"));
        }
    }

    fn endpoint_sink(&self, call_id: &str) -> EventSink {
        let tx = self.core_sender.clone();
        let call_id = call_id.to_string();
        Box::new(move |event| {
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::Endpoint {
                call_id: call_id.clone(),
                event,
            })));
        })
    }

    fn set_call_phase(&mut self, phase: CallPhase) {
        if let Some(snapshot) = self.state.active_call.as_mut() {
            if snapshot.phase != phase {
                snapshot.phase = phase;
                self.emit_state();
            }
        }
    }

    /// Build the transport for a call: connect, attach tracks, and hand
    /// back a shared endpoint handle. On failure the half-built endpoint
    /// is closed, never leaked.
    fn build_endpoint(
        &self,
        call_id: &str,
        tracks: &LocalTracks,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let endpoint: Arc<dyn MediaEndpoint> =
            Arc::from(self.media.connect(self.endpoint_sink(call_id))?);
        if let Err(e) = endpoint.add_tracks(tracks) {
            endpoint.close();
            return Err(e);
        }
        Ok(endpoint)
    }

    pub(super) fn handle_start_call_action(
        &mut self,
        target_id: &str,
        target_name: &str,
        target_avatar: Option<String>,
        media_kind: MediaKind,
    ) {
        if self.room.is_none() {
            self.toast("Join a room before calling");
            return;
        }
        if self.active_call.is_some() || self.pending_incoming.is_some() {
            self.toast("Already in a call");
            return;
        }
        if target_id == self.state.participant_id {
            self.toast("Cannot call yourself");
            return;
        }

        let tracks = match self
            .media
            .acquire_local(true, media_kind == MediaKind::Video)
        {
            Ok(v) => v,
            Err(MediaError::AccessDenied) => {
                self.toast("Microphone/camera access denied");
                return;
            }
            Err(e) => {
                self.toast(format!("Media capture failed: {e}"));
                return;
            }
        };

        let call_id = uuid::Uuid::new_v4().to_string();
        let endpoint = match self.build_endpoint(&call_id, &tracks) {
            Ok(v) => v,
            Err(e) => {
                tracks.stop();
                self.toast(format!("Call setup failed: {e}"));
                return;
            }
        };
        let description = match endpoint.create_offer(false).and_then(|offer| {
            endpoint.set_local_description(offer.clone())?;
            Ok(offer)
        }) {
            Ok(offer) => offer,
            Err(e) => {
                // Setup failures release everything they built.
                tracks.stop();
                endpoint.close();
                self.toast(format!("Call setup failed: {e}"));
                return;
            }
        };

        let worker = CaptureWorker::spawn(
            &call_id,
            endpoint.clone(),
            self.core_sender.clone(),
            self.stats_interval_ms(),
        );
        let remote = RemoteParty {
            id: target_id.to_string(),
            name: target_name.to_string(),
            avatar: target_avatar,
        };
        self.active_call = Some(ActiveCall {
            call_id: call_id.clone(),
            is_initiator: true,
            remote: remote.clone(),
            media_kind,
            endpoint,
            tracks,
            worker,
            candidates: VecDeque::new(),
            reconnect_since: None,
            restart_sent: false,
        });
        self.state.active_call = Some(CallSnapshot::new(
            call_id.clone(),
            CallPhase::Calling,
            true,
            remote,
            media_kind,
        ));
        self.emit_state();

        info!(%call_id, target = target_id, media = %media_kind, "call started");
        let signal = self.outgoing_signal(
            &call_id,
            target_id,
            SignalBody::Offer {
                description,
                media: media_kind,
                ice_restart: false,
            },
        );
        self.send_call_signal(signal);
    }

    pub(super) fn handle_answer_call_action(&mut self) {
        if self.call_phase() != Some(CallPhase::Incoming) {
            return;
        }
        let Some(pending) = self.pending_incoming.take() else {
            return;
        };

        let tracks = match self
            .media
            .acquire_local(true, pending.media_kind == MediaKind::Video)
        {
            Ok(v) => v,
            Err(MediaError::AccessDenied) => {
                self.toast("Microphone/camera access denied");
                self.cleanup_call();
                return;
            }
            Err(e) => {
                self.toast(format!("Media capture failed: {e}"));
                self.cleanup_call();
                return;
            }
        };

        let mut queued = pending.candidates;
        let endpoint = match self.build_endpoint(&pending.call_id, &tracks) {
            Ok(v) => v,
            Err(e) => {
                tracks.stop();
                self.toast(format!("Call setup failed: {e}"));
                self.cleanup_call();
                return;
            }
        };
        let negotiate = (|| {
            endpoint.set_remote_description(pending.description.clone())?;
            apply_queued_candidates(&endpoint, &mut queued);
            let answer = endpoint.create_answer()?;
            endpoint.set_local_description(answer.clone())?;
            Ok::<_, MediaError>(answer)
        })();
        let answer = match negotiate {
            Ok(v) => v,
            Err(e) => {
                // Setup failures release everything they built.
                tracks.stop();
                endpoint.close();
                self.toast(format!("Call setup failed: {e}"));
                self.cleanup_call();
                return;
            }
        };

        self.ringer.stop();
        let worker = CaptureWorker::spawn(
            &pending.call_id,
            endpoint.clone(),
            self.core_sender.clone(),
            self.stats_interval_ms(),
        );
        self.active_call = Some(ActiveCall {
            call_id: pending.call_id.clone(),
            is_initiator: false,
            remote: pending.from.clone(),
            media_kind: pending.media_kind,
            endpoint,
            tracks,
            worker,
            candidates: VecDeque::new(),
            reconnect_since: None,
            restart_sent: false,
        });
        self.state.active_call = Some(CallSnapshot::new(
            pending.call_id.clone(),
            CallPhase::Connected,
            false,
            pending.from.clone(),
            pending.media_kind,
        ));
        self.emit_state();

        info!(call_id = %pending.call_id, from = %pending.from.id, "call answered");
        let signal = self.outgoing_signal(
            &pending.call_id,
            &pending.from.id,
            SignalBody::Answer {
                description: answer,
            },
        );
        self.send_call_signal(signal);
    }

    pub(super) fn handle_reject_call_action(&mut self) {
        if self.call_phase() != Some(CallPhase::Incoming) {
            return;
        }
        if let Some(pending) = self.pending_incoming.as_ref() {
            let signal = self.outgoing_signal(
                &pending.call_id,
                &pending.from.id,
                SignalBody::Reject {
                    reason: RejectReason::Declined,
                },
            );
            self.send_call_signal(signal);
        }
        self.cleanup_call();
    }

    pub(super) fn handle_hangup_action(&mut self) {
        let target = self
            .active_call
            .as_ref()
            .map(|c| (c.call_id.clone(), c.remote.id.clone()))
            .or_else(|| {
                self.pending_incoming
                    .as_ref()
                    .map(|p| (p.call_id.clone(), p.from.id.clone()))
            });
        let Some((call_id, remote_id)) = target else {
            return;
        };
        info!(%call_id, "hangup");
        let signal = self.outgoing_signal(&call_id, &remote_id, SignalBody::Bye);
        self.send_call_signal(signal);
        self.cleanup_call();
    }

    pub(super) fn handle_toggle_mute_action(&mut self) {
        if self.call_phase() != Some(CallPhase::Connected) {
            return;
        }
        let muted = match self.state.active_call.as_mut() {
            Some(snapshot) => {
                snapshot.is_muted = !snapshot.is_muted;
                snapshot.is_muted
            }
            None => return,
        };
        if let Some(active) = self.active_call.as_ref() {
            active.worker.set_muted(muted);
            active.endpoint.set_track_enabled(MediaKind::Audio, !muted);
        }
        self.emit_state();
    }

    pub(super) fn handle_toggle_camera_action(&mut self) {
        if self.call_phase() != Some(CallPhase::Connected) {
            return;
        }
        if self.active_call.as_ref().map(|c| c.media_kind) != Some(MediaKind::Video) {
            return;
        }
        let enabled = match self.state.active_call.as_mut() {
            Some(snapshot) => {
                snapshot.is_camera_enabled = !snapshot.is_camera_enabled;
                snapshot.is_camera_enabled
            }
            None => return,
        };
        if let Some(active) = self.active_call.as_ref() {
            active.endpoint.set_track_enabled(MediaKind::Video, enabled);
        }
        self.emit_state();
    }

    pub(super) fn handle_switch_camera_action(&mut self) {
        if self.call_phase() != Some(CallPhase::Connected) {
            return;
        }
        let Some(active) = self.active_call.as_ref() else {
            return;
        };
        if active.media_kind != MediaKind::Video {
            return;
        }
        // Track replacement on the live transport; no renegotiation.
        let result = self
            .media
            .switch_camera()
            .and_then(|track| active.endpoint.replace_track(MediaKind::Video, track));
        if let Err(e) = result {
            self.toast(format!("Camera switch failed: {e}"));
        }
    }

    pub(super) fn handle_set_voice_filter_action(&mut self, mode: VoiceFilterMode) {
        if self.call_phase() != Some(CallPhase::Connected) {
            return;
        }
        let Some(active) = self.active_call.as_ref() else {
            return;
        };
        active.worker.set_filter(mode);
        if let Some(snapshot) = self.state.active_call.as_mut() {
            snapshot.voice_filter = mode;
            self.emit_state();
        }
    }

    /// Route one inbound signal. The caller has already dropped
    /// self-echoes and signals addressed to another participant.
    pub(super) fn handle_call_signal(&mut self, msg: SignalMessage) {
        debug!(kind = msg.body.kind(), call_id = %msg.call_id, from = %msg.from, "signal received");
        match msg.body.clone() {
            SignalBody::Offer {
                description,
                media,
                ice_restart,
            } => self.on_offer(msg, description, media, ice_restart),
            SignalBody::Answer { description } => self.on_answer(&msg.call_id, description),
            SignalBody::Candidate { candidate } => self.on_candidate(&msg.call_id, candidate),
            SignalBody::Reject { reason } => self.on_reject(&msg.call_id, reason),
            SignalBody::Bye => self.on_bye(&msg.call_id),
        }
    }

    fn on_offer(
        &mut self,
        msg: SignalMessage,
        description: SessionDescription,
        media: MediaKind,
        ice_restart: bool,
    ) {
        // Renegotiation of the live call (the peer's ICE restart).
        if let Some(active) = self.active_call.as_mut() {
            if active.call_id == msg.call_id {
                info!(call_id = %msg.call_id, ice_restart, "renegotiation offer");
                let endpoint = active.endpoint.clone();
                let renegotiate = endpoint
                    .set_remote_description(description)
                    .and_then(|()| {
                        apply_queued_candidates(&endpoint, &mut active.candidates);
                        let answer = endpoint.create_answer()?;
                        endpoint.set_local_description(answer.clone())?;
                        Ok(answer)
                    });
                match renegotiate {
                    Ok(answer) => {
                        let signal = self.outgoing_signal(
                            &msg.call_id,
                            &msg.from,
                            SignalBody::Answer {
                                description: answer,
                            },
                        );
                        self.send_call_signal(signal);
                    }
                    Err(e) => warn!(call_id = %msg.call_id, err = %e, "renegotiation failed"),
                }
                return;
            }
            // A different call while one is live: explicit busy reject so
            // the caller does not have to time out blind.
            self.send_busy_reject(&msg.call_id, &msg.from);
            return;
        }

        if let Some(pending) = self.pending_incoming.as_mut() {
            if pending.call_id == msg.call_id {
                // At-least-once redelivery of the same offer.
                pending.description = description;
                return;
            }
            self.send_busy_reject(&msg.call_id, &msg.from);
            return;
        }

        // Idle: surface the incoming call and ring. No auto-answer.
        let from = RemoteParty {
            id: msg.from.clone(),
            name: msg.from_name.clone(),
            avatar: msg.from_avatar.clone(),
        };
        info!(call_id = %msg.call_id, from = %from.id, media = %media, "incoming call");
        self.pending_incoming = Some(PendingIncoming {
            call_id: msg.call_id.clone(),
            from: from.clone(),
            description,
            media_kind: media,
            candidates: VecDeque::new(),
        });
        self.ringer.start();
        self.state.active_call = Some(CallSnapshot::new(
            msg.call_id,
            CallPhase::Incoming,
            false,
            from,
            media,
        ));
        self.emit_state();
    }

    fn send_busy_reject(&mut self, call_id: &str, to: &str) {
        info!(%call_id, "busy, rejecting offer");
        let signal = self.outgoing_signal(
            call_id,
            to,
            SignalBody::Reject {
                reason: RejectReason::Busy,
            },
        );
        self.send_call_signal(signal);
    }

    fn on_answer(&mut self, call_id: &str, description: SessionDescription) {
        let phase = self.call_phase();
        if !matches!(phase, Some(CallPhase::Calling) | Some(CallPhase::Reconnecting)) {
            return;
        }
        let Some(active) = self.active_call.as_mut() else {
            return;
        };
        if active.call_id != call_id {
            return;
        }
        // Duplicate/late answer while still negotiating: applying twice
        // must be a no-op.
        if phase == Some(CallPhase::Calling) && active.endpoint.has_remote_description() {
            debug!(%call_id, "duplicate answer ignored");
            return;
        }

        let endpoint = active.endpoint.clone();
        let remote_id = active.remote.id.clone();
        if let Err(e) = endpoint.set_remote_description(description) {
            warn!(%call_id, err = %e, "answer apply failed");
            self.toast(format!("Call setup failed: {e}"));
            let signal = self.outgoing_signal(call_id, &remote_id, SignalBody::Bye);
            self.send_call_signal(signal);
            self.cleanup_call();
            return;
        }
        apply_queued_candidates(&endpoint, &mut active.candidates);
        active.reconnect_since = None;
        active.restart_sent = false;
        self.set_call_phase(CallPhase::Connected);
    }

    fn on_candidate(&mut self, call_id: &str, candidate: IceCandidate) {
        if let Some(active) = self.active_call.as_mut() {
            if active.call_id != call_id {
                debug!(%call_id, "candidate for unknown call dropped");
                return;
            }
            if active.endpoint.has_remote_description() {
                if let Err(e) = active.endpoint.add_ice_candidate(&candidate) {
                    // Malformed candidates are dropped, never fatal.
                    warn!(%call_id, err = %e, "candidate dropped");
                }
            } else {
                active.candidates.push_back(candidate);
            }
            return;
        }
        if let Some(pending) = self.pending_incoming.as_mut() {
            if pending.call_id == call_id {
                pending.candidates.push_back(candidate);
                return;
            }
        }
        debug!(%call_id, "candidate for unknown call dropped");
    }

    fn on_reject(&mut self, call_id: &str, reason: RejectReason) {
        if self.matches_pending(call_id) {
            self.cleanup_call();
            return;
        }
        if self.matches_active(call_id) {
            info!(%call_id, ?reason, "call rejected by peer");
            self.toast(match reason {
                RejectReason::Busy => "Peer is busy",
                RejectReason::Declined => "Call declined",
            });
            self.cleanup_call();
        }
    }

    fn on_bye(&mut self, call_id: &str) {
        if self.matches_pending(call_id) {
            info!(%call_id, "caller hung up before answer");
            self.cleanup_call();
            return;
        }
        if self.matches_active(call_id) {
            info!(%call_id, "call ended by peer");
            self.toast("Call ended");
            self.cleanup_call();
        }
    }

    fn matches_pending(&self, call_id: &str) -> bool {
        self.pending_incoming
            .as_ref()
            .is_some_and(|p| p.call_id == call_id)
    }

    fn matches_active(&self, call_id: &str) -> bool {
        self.active_call
            .as_ref()
            .is_some_and(|c| c.call_id == call_id)
    }

    pub(super) fn handle_endpoint_event(&mut self, call_id: &str, event: EndpointEvent) {
        if !self.matches_active(call_id) {
            // Stale event from an abandoned call.
            return;
        }
        match event {
            EndpointEvent::LocalCandidate(candidate) => {
                let remote_id = match self.active_call.as_ref() {
                    Some(active) => active.remote.id.clone(),
                    None => return,
                };
                let signal = self.outgoing_signal(
                    call_id,
                    &remote_id,
                    SignalBody::Candidate { candidate },
                );
                self.send_call_signal(signal);
            }
            EndpointEvent::RemoteTrack(track) => {
                debug!(%call_id, track = %track.label, "remote track");
            }
            EndpointEvent::ConnectionState(state) => self.on_connection_state(call_id, state),
        }
    }

    fn on_connection_state(&mut self, call_id: &str, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                // Transport recovery returns any non-Idle phase to Connected.
                if let Some(active) = self.active_call.as_mut() {
                    active.reconnect_since = None;
                    active.restart_sent = false;
                }
                self.set_call_phase(CallPhase::Connected);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                if self.call_phase() != Some(CallPhase::Connected) {
                    return;
                }
                warn!(%call_id, ?state, "transport lost, reconnecting");
                let mut restart_offer = None;
                if let Some(active) = self.active_call.as_mut() {
                    active.reconnect_since = Some(Instant::now());
                    // One automatic ICE restart, driven by the original
                    // initiator; the callee side only waits.
                    if active.is_initiator && !active.restart_sent {
                        let endpoint = active.endpoint.clone();
                        match endpoint.create_offer(true).and_then(|offer| {
                            endpoint.set_local_description(offer.clone())?;
                            Ok(offer)
                        }) {
                            Ok(offer) => {
                                active.restart_sent = true;
                                restart_offer =
                                    Some((active.remote.id.clone(), active.media_kind, offer));
                            }
                            Err(e) => warn!(%call_id, err = %e, "ice restart offer failed"),
                        }
                    }
                }
                self.set_call_phase(CallPhase::Reconnecting);
                if let Some((remote_id, media, description)) = restart_offer {
                    let signal = self.outgoing_signal(
                        call_id,
                        &remote_id,
                        SignalBody::Offer {
                            description,
                            media,
                            ice_restart: true,
                        },
                    );
                    self.send_call_signal(signal);
                }
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {}
        }
    }

    pub(super) fn handle_call_tick(&mut self, call_id: &str, stats: TransportStats) {
        if !self.matches_active(call_id) {
            return;
        }
        let timed_out = self
            .active_call
            .as_ref()
            .and_then(|c| c.reconnect_since)
            .is_some_and(|since| since.elapsed() >= self.reconnect_timeout());
        if self.call_phase() == Some(CallPhase::Reconnecting) && timed_out {
            warn!(%call_id, "reconnect window elapsed, dropping call");
            self.toast("Call dropped: connection did not recover");
            let remote_id = match self.active_call.as_ref() {
                Some(active) => active.remote.id.clone(),
                None => return,
            };
            let signal = self.outgoing_signal(call_id, &remote_id, SignalBody::Bye);
            self.send_call_signal(signal);
            self.cleanup_call();
            return;
        }
        if let Some(snapshot) = self.state.active_call.as_mut() {
            let next = CallStats {
                tx_frames: stats.tx_frames,
                rx_frames: stats.rx_frames,
            };
            if snapshot.stats != next {
                snapshot.stats = next;
                self.emit_state();
            }
        }
    }

    /// The single teardown path. Safe from any phase, including
    /// mid-negotiation, and a no-op when nothing is live.
    pub(super) fn cleanup_call(&mut self) {
        self.ringer.stop();
        self.pending_incoming = None;
        // Dropping the call releases tracks, transport, and the worker.
        self.active_call = None;
        if self.state.active_call.take().is_some() {
            self.emit_state();
        }
    }
}

fn apply_queued_candidates(endpoint: &Arc<dyn MediaEndpoint>, queue: &mut VecDeque<IceCandidate>) {
    while let Some(candidate) = queue.pop_front() {
        if let Err(e) = endpoint.add_ice_candidate(&candidate) {
            warn!(err = %e, "queued candidate dropped");
        }
    }
}
