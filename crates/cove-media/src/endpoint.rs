use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Negotiated description of a transport's capabilities, exchanged as
/// the payload of Offer/Answer signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A discovered network path endpoint proposed for the direct media
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

/// Locally captured tracks. `stop` releases the capture devices and is
/// an idempotent no-op once released.
#[derive(Debug, Clone)]
pub struct LocalTracks {
    pub audio: MediaTrack,
    pub video: Option<MediaTrack>,
    released: Arc<AtomicBool>,
}

impl LocalTracks {
    pub fn new(audio: MediaTrack, video: Option<MediaTrack>) -> Self {
        Self {
            audio,
            video,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared release flag, observable after the track set owner is gone
    /// (the loopback fabric keeps one per acquisition for assertions).
    pub fn release_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    pub fn stop(&self) {
        self.released.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
}

/// Asynchronous notifications from a transport endpoint. Delivery order
/// is preserved per endpoint; consumers route these into their own
/// event loop and must tolerate events from an already-abandoned call.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    ConnectionState(ConnectionState),
}

pub type EventSink = Box<dyn Fn(EndpointEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    AccessDenied,
    NotConnected,
    Closed,
    InvalidDescription(String),
    InvalidCandidate(String),
    TrackUnavailable(String),
}

impl Display for MediaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessDenied => write!(f, "media capture permission denied"),
            Self::NotConnected => write!(f, "media transport is not connected"),
            Self::Closed => write!(f, "media transport is closed"),
            Self::InvalidDescription(msg) => write!(f, "invalid session description: {msg}"),
            Self::InvalidCandidate(msg) => write!(f, "invalid candidate: {msg}"),
            Self::TrackUnavailable(msg) => write!(f, "track unavailable: {msg}"),
        }
    }
}

impl std::error::Error for MediaError {}

/// Capture + transport factory for one participant.
pub trait MediaConnector: Send + Sync {
    /// Acquire local capture. Fails with [`MediaError::AccessDenied`]
    /// when the user refuses permission.
    fn acquire_local(&self, audio: bool, video: bool) -> Result<LocalTracks, MediaError>;

    /// Build a transport endpoint. `events` receives candidates, remote
    /// tracks, and connection-state changes for this endpoint only.
    fn connect(&self, events: EventSink) -> Result<Box<dyn MediaEndpoint>, MediaError>;

    /// Capture track for the alternate camera, to be swapped into a live
    /// transport via [`MediaEndpoint::replace_track`].
    fn switch_camera(&self) -> Result<MediaTrack, MediaError>;
}

/// One peer-to-peer media transport. All methods take `&self` so the
/// endpoint can be shared with the capture worker thread; implementations
/// synchronize internally.
pub trait MediaEndpoint: Send + Sync {
    fn add_tracks(&self, tracks: &LocalTracks) -> Result<(), MediaError>;
    fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError>;
    fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    fn has_remote_description(&self) -> bool;
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;
    /// Swap an outgoing track on the live transport. No renegotiation.
    fn replace_track(&self, kind: MediaKind, track: MediaTrack) -> Result<(), MediaError>;
    fn set_track_enabled(&self, kind: MediaKind, enabled: bool);
    /// Media path (not signaling): push one captured audio frame.
    fn send_audio_frame(&self, pcm: &[i16]) -> Result<(), MediaError>;
    fn stats(&self) -> TransportStats;
    /// Idempotent; releasing an already-closed endpoint is a no-op.
    fn close(&self);
}
