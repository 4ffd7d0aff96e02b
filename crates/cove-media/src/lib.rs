//! Media capability layer for Cove calls.
//!
//! The call state machine consumes two interfaces: [`MediaConnector`]
//! (capture acquisition, transport construction) and [`MediaEndpoint`]
//! (offer/answer exchange, candidates, track control, the frame path).
//! [`LoopbackFabric`] is the in-process implementation used by the
//! default runtime and by every test; a platform build would supply a
//! WebRTC-backed implementation of the same traits.
//!
//! [`VoiceFilterChain`] is the optional in-path audio transform applied
//! to captured PCM before it reaches the endpoint.

mod endpoint;
mod filter;
mod loopback;

pub use endpoint::{
    ConnectionState, EndpointEvent, EventSink, IceCandidate, LocalTracks, MediaConnector,
    MediaEndpoint, MediaError, MediaKind, MediaTrack, SdpKind, SessionDescription, TransportStats,
};
pub use filter::{VoiceFilterChain, VoiceFilterMode};
pub use loopback::{LoopbackConnector, LoopbackFabric};
