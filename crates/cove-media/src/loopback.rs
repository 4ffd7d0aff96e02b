use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::endpoint::{
    ConnectionState, EndpointEvent, EventSink, IceCandidate, LocalTracks, MediaConnector,
    MediaEndpoint, MediaError, MediaKind, MediaTrack, SdpKind, SessionDescription, TransportStats,
};

/// Synthetic candidates emitted per local description.
const CANDIDATES_PER_DESCRIPTION: usize = 2;

/// In-process transport hub. Two endpoints become `Connected` once their
/// descriptions cross-match: each side's local description equals the
/// other side's remote description, and both local descriptions carry
/// the same negotiation generation. The generation is bumped by an
/// ice-restart offer, so a stale pre-restart answer can never relink a
/// severed transport.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<Mutex<FabricInner>>,
}

struct FabricInner {
    endpoints: HashMap<u64, EndpointSlot>,
    next_id: u64,
    deny_media: bool,
    release_flags: Vec<Arc<AtomicBool>>,
}

struct EndpointSlot {
    name: String,
    events: Arc<EventSink>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    generation: u32,
    connection: ConnectionState,
    stats: TransportStats,
    peer: Option<u64>,
    local_tracks: Vec<MediaTrack>,
    enabled: HashMap<MediaKind, bool>,
    applied_candidates: Vec<IceCandidate>,
}

impl EndpointSlot {
    fn new(name: String, events: EventSink) -> Self {
        Self {
            name,
            events: Arc::new(events),
            local: None,
            remote: None,
            generation: 0,
            connection: ConnectionState::New,
            stats: TransportStats::default(),
            peer: None,
            local_tracks: Vec::new(),
            enabled: HashMap::new(),
            applied_candidates: Vec::new(),
        }
    }
}

type PendingEvents = Vec<(Arc<EventSink>, EndpointEvent)>;

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FabricInner {
                endpoints: HashMap::new(),
                next_id: 0,
                deny_media: false,
                release_flags: Vec::new(),
            })),
        }
    }

    pub fn connector(&self, name: impl Into<String>) -> LoopbackConnector {
        LoopbackConnector {
            fabric: self.inner.clone(),
            name: name.into(),
            rear_camera: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent capture acquisition fail with
    /// [`MediaError::AccessDenied`].
    pub fn deny_media(&self, deny: bool) {
        self.lock().deny_media = deny;
    }

    /// Drop every live transport link. Both sides observe
    /// `Disconnected`; relinking requires a fresh negotiation at a new
    /// generation (an ice-restart offer/answer exchange).
    pub fn sever(&self) {
        let mut pending: PendingEvents = Vec::new();
        {
            let mut inner = self.lock();
            let connected: Vec<u64> = inner
                .endpoints
                .iter()
                .filter(|(_, slot)| slot.connection == ConnectionState::Connected)
                .map(|(&id, _)| id)
                .collect();
            for id in connected {
                if let Some(slot) = inner.endpoints.get_mut(&id) {
                    slot.connection = ConnectionState::Disconnected;
                    slot.peer = None;
                    pending.push((
                        slot.events.clone(),
                        EndpointEvent::ConnectionState(ConnectionState::Disconnected),
                    ));
                }
            }
        }
        deliver(pending);
    }

    /// Number of endpoint slots the fabric currently tracks. Closing an
    /// endpoint removes its slot.
    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// True once every track set handed out by [`MediaConnector::acquire_local`]
    /// has been stopped.
    pub fn all_tracks_released(&self) -> bool {
        self.lock()
            .release_flags
            .iter()
            .all(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
    }

    /// Candidates applied to the most recently connected endpoint of
    /// `name`, in application order.
    pub fn applied_candidates(&self, name: &str) -> Vec<IceCandidate> {
        let inner = self.lock();
        inner
            .endpoints
            .values()
            .filter(|slot| slot.name == name)
            .max_by_key(|slot| slot.applied_candidates.len())
            .map(|slot| slot.applied_candidates.clone())
            .unwrap_or_default()
    }

    /// Whether the named side currently sends the given track kind.
    pub fn track_enabled(&self, name: &str, kind: MediaKind) -> Option<bool> {
        let inner = self.lock();
        inner
            .endpoints
            .values()
            .filter(|slot| slot.name == name)
            .find_map(|slot| slot.enabled.get(&kind).copied())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricInner {
    /// Relink pass, run after any description change. Connects the first
    /// pair whose descriptions cross-match at a shared generation.
    fn try_link(&mut self, pending: &mut PendingEvents) {
        let ids: Vec<u64> = self.endpoints.keys().copied().collect();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                if self.descriptions_match(a, b) {
                    self.link(a, b, pending);
                }
            }
        }
    }

    fn descriptions_match(&self, a: u64, b: u64) -> bool {
        let (Some(sa), Some(sb)) = (self.endpoints.get(&a), self.endpoints.get(&b)) else {
            return false;
        };
        if sa.connection == ConnectionState::Connected && sb.connection == ConnectionState::Connected
        {
            return false;
        }
        let (Some(al), Some(ar)) = (&sa.local, &sa.remote) else {
            return false;
        };
        let (Some(bl), Some(br)) = (&sb.local, &sb.remote) else {
            return false;
        };
        al.sdp == br.sdp
            && bl.sdp == ar.sdp
            && parse_generation(&al.sdp) == parse_generation(&bl.sdp)
    }

    fn link(&mut self, a: u64, b: u64, pending: &mut PendingEvents) {
        let b_tracks = self
            .endpoints
            .get(&b)
            .map(|s| s.local_tracks.clone())
            .unwrap_or_default();
        let a_tracks = self
            .endpoints
            .get(&a)
            .map(|s| s.local_tracks.clone())
            .unwrap_or_default();
        if let Some(slot) = self.endpoints.get_mut(&a) {
            slot.connection = ConnectionState::Connected;
            slot.peer = Some(b);
            for track in &b_tracks {
                pending.push((slot.events.clone(), EndpointEvent::RemoteTrack(track.clone())));
            }
            pending.push((
                slot.events.clone(),
                EndpointEvent::ConnectionState(ConnectionState::Connected),
            ));
        }
        if let Some(slot) = self.endpoints.get_mut(&b) {
            slot.connection = ConnectionState::Connected;
            slot.peer = Some(a);
            for track in &a_tracks {
                pending.push((slot.events.clone(), EndpointEvent::RemoteTrack(track.clone())));
            }
            pending.push((
                slot.events.clone(),
                EndpointEvent::ConnectionState(ConnectionState::Connected),
            ));
        }
        debug!(a, b, "loopback transports linked");
    }
}

fn parse_generation(sdp: &str) -> Option<u32> {
    sdp.split(':')
        .nth(2)
        .and_then(|tag| tag.strip_prefix('g'))
        .and_then(|n| n.parse().ok())
}

fn make_sdp(kind: SdpKind, generation: u32) -> String {
    let tag = match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    format!("loopback:{}:g{}:{}", tag, generation, Uuid::new_v4())
}

fn deliver(pending: PendingEvents) {
    for (sink, event) in pending {
        sink(event);
    }
}

/// Per-participant factory over a shared [`LoopbackFabric`].
#[derive(Clone)]
pub struct LoopbackConnector {
    fabric: Arc<Mutex<FabricInner>>,
    name: String,
    rear_camera: Arc<AtomicBool>,
}

impl LoopbackConnector {
    fn lock(&self) -> std::sync::MutexGuard<'_, FabricInner> {
        self.fabric.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MediaConnector for LoopbackConnector {
    fn acquire_local(&self, audio: bool, video: bool) -> Result<LocalTracks, MediaError> {
        let mut inner = self.lock();
        if inner.deny_media {
            return Err(MediaError::AccessDenied);
        }
        if !audio {
            return Err(MediaError::TrackUnavailable("audio capture is required".into()));
        }
        let audio_track = MediaTrack {
            id: Uuid::new_v4().to_string(),
            kind: MediaKind::Audio,
            label: format!("{}:mic", self.name),
        };
        let video_track = video.then(|| MediaTrack {
            id: Uuid::new_v4().to_string(),
            kind: MediaKind::Video,
            label: format!("{}:camera:front", self.name),
        });
        let tracks = LocalTracks::new(audio_track, video_track);
        inner.release_flags.push(tracks.release_flag());
        Ok(tracks)
    }

    fn connect(&self, events: EventSink) -> Result<Box<dyn MediaEndpoint>, MediaError> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .endpoints
            .insert(id, EndpointSlot::new(self.name.clone(), events));
        debug!(id, name = %self.name, "loopback endpoint created");
        Ok(Box::new(LoopbackEndpoint {
            fabric: self.fabric.clone(),
            id,
        }))
    }

    fn switch_camera(&self) -> Result<MediaTrack, MediaError> {
        use std::sync::atomic::Ordering;
        let rear = !self.rear_camera.load(Ordering::Relaxed);
        self.rear_camera.store(rear, Ordering::Relaxed);
        let facing = if rear { "rear" } else { "front" };
        Ok(MediaTrack {
            id: Uuid::new_v4().to_string(),
            kind: MediaKind::Video,
            label: format!("{}:camera:{}", self.name, facing),
        })
    }
}

pub struct LoopbackEndpoint {
    fabric: Arc<Mutex<FabricInner>>,
    id: u64,
}

impl LoopbackEndpoint {
    fn lock(&self) -> std::sync::MutexGuard<'_, FabricInner> {
        self.fabric.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_open_slot<T>(
        &self,
        f: impl FnOnce(&mut EndpointSlot) -> Result<T, MediaError>,
    ) -> Result<T, MediaError> {
        let mut inner = self.lock();
        let slot = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(MediaError::Closed)?;
        f(slot)
    }
}

impl MediaEndpoint for LoopbackEndpoint {
    fn add_tracks(&self, tracks: &LocalTracks) -> Result<(), MediaError> {
        self.with_open_slot(|slot| {
            slot.local_tracks.push(tracks.audio.clone());
            slot.enabled.insert(MediaKind::Audio, true);
            if let Some(video) = &tracks.video {
                slot.local_tracks.push(video.clone());
                slot.enabled.insert(MediaKind::Video, true);
            }
            Ok(())
        })
    }

    fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        self.with_open_slot(|slot| {
            if ice_restart {
                slot.generation += 1;
            }
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: make_sdp(SdpKind::Offer, slot.generation),
            })
        })
    }

    fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.with_open_slot(|slot| {
            let remote = slot.remote.as_ref().ok_or_else(|| {
                MediaError::InvalidDescription("no remote offer to answer".into())
            })?;
            if remote.kind != SdpKind::Offer {
                return Err(MediaError::InvalidDescription(
                    "remote description is not an offer".into(),
                ));
            }
            let generation = parse_generation(&remote.sdp).ok_or_else(|| {
                MediaError::InvalidDescription("remote offer carries no generation".into())
            })?;
            slot.generation = generation;
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: make_sdp(SdpKind::Answer, generation),
            })
        })
    }

    fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut pending: PendingEvents = Vec::new();
        {
            let mut inner = self.lock();
            let slot = inner
                .endpoints
                .get_mut(&self.id)
                .ok_or(MediaError::Closed)?;
            if parse_generation(&desc.sdp).is_none() {
                return Err(MediaError::InvalidDescription(format!(
                    "malformed description: {}",
                    desc.sdp
                )));
            }
            slot.local = Some(desc);
            let events = slot.events.clone();
            for n in 0..CANDIDATES_PER_DESCRIPTION {
                pending.push((
                    events.clone(),
                    EndpointEvent::LocalCandidate(IceCandidate {
                        candidate: format!("candidate:loopback {} udp {}", n, Uuid::new_v4()),
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                    }),
                ));
            }
            inner.try_link(&mut pending);
        }
        deliver(pending);
        Ok(())
    }

    fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut pending: PendingEvents = Vec::new();
        {
            let mut inner = self.lock();
            let slot = inner
                .endpoints
                .get_mut(&self.id)
                .ok_or(MediaError::Closed)?;
            if parse_generation(&desc.sdp).is_none() {
                return Err(MediaError::InvalidDescription(format!(
                    "malformed description: {}",
                    desc.sdp
                )));
            }
            slot.remote = Some(desc);
            inner.try_link(&mut pending);
        }
        deliver(pending);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        let inner = self.lock();
        inner
            .endpoints
            .get(&self.id)
            .map(|slot| slot.remote.is_some())
            .unwrap_or(false)
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.with_open_slot(|slot| {
            if candidate.candidate.is_empty() {
                return Err(MediaError::InvalidCandidate("empty candidate".into()));
            }
            // Candidates are only applicable once a remote description
            // exists; callers queue until then.
            if slot.remote.is_none() {
                return Err(MediaError::NotConnected);
            }
            slot.applied_candidates.push(candidate.clone());
            Ok(())
        })
    }

    fn replace_track(&self, kind: MediaKind, track: MediaTrack) -> Result<(), MediaError> {
        if track.kind != kind {
            return Err(MediaError::TrackUnavailable(format!(
                "cannot install {} track as {}",
                track.kind, kind
            )));
        }
        self.with_open_slot(|slot| {
            match slot.local_tracks.iter_mut().find(|t| t.kind == kind) {
                Some(existing) => {
                    *existing = track;
                    Ok(())
                }
                None => Err(MediaError::TrackUnavailable(format!(
                    "no {} track to replace",
                    kind
                ))),
            }
        })
    }

    fn set_track_enabled(&self, kind: MediaKind, enabled: bool) {
        let mut inner = self.lock();
        if let Some(slot) = inner.endpoints.get_mut(&self.id) {
            slot.enabled.insert(kind, enabled);
        }
    }

    fn send_audio_frame(&self, pcm: &[i16]) -> Result<(), MediaError> {
        if pcm.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        let slot = inner
            .endpoints
            .get_mut(&self.id)
            .ok_or(MediaError::Closed)?;
        if slot.connection != ConnectionState::Connected {
            return Err(MediaError::NotConnected);
        }
        let peer = slot.peer.ok_or(MediaError::NotConnected)?;
        slot.stats.tx_frames += 1;
        if let Some(peer_slot) = inner.endpoints.get_mut(&peer) {
            peer_slot.stats.rx_frames += 1;
        }
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        let inner = self.lock();
        inner
            .endpoints
            .get(&self.id)
            .map(|slot| slot.stats)
            .unwrap_or_default()
    }

    fn close(&self) {
        let mut pending: PendingEvents = Vec::new();
        {
            let mut inner = self.lock();
            // The slot leaves the map on close; a second close finds
            // nothing and emits nothing.
            let Some(slot) = inner.endpoints.remove(&self.id) else {
                return;
            };
            pending.push((
                slot.events.clone(),
                EndpointEvent::ConnectionState(ConnectionState::Closed),
            ));
            if let Some(peer) = slot.peer {
                if let Some(peer_slot) = inner.endpoints.get_mut(&peer) {
                    if peer_slot.connection == ConnectionState::Connected {
                        peer_slot.connection = ConnectionState::Disconnected;
                        peer_slot.peer = None;
                        pending.push((
                            peer_slot.events.clone(),
                            EndpointEvent::ConnectionState(ConnectionState::Disconnected),
                        ));
                    }
                }
            }
        }
        deliver(pending);
    }
}
