//! Media engine adapter interface
//!
//! The actual WebRTC (or other media) stack lives behind [`MediaEngineAdapter`].
//! Every operation is a one-shot asynchronous call resolved exactly once by the
//! adapter; engine-originated notifications arrive as [`MediaEngineEvent`]s on
//! the channel handed over at peer-connection creation, so adapters never need
//! a wide observer interface full of no-op overrides.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocols::ice::IceCandidate;

/// Opaque handle to an adapter-owned peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

/// Opaque handle to an adapter-owned media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle(pub u64);

/// Raw peer-connection state as reported by the underlying engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Which half of the offer/answer exchange an SDP payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub receive_audio: bool,
    pub receive_video: bool,
}

/// Notifications pushed by the underlying engine on its own callback thread.
#[derive(Debug, Clone)]
pub enum MediaEngineEvent {
    IceCandidateAdded {
        candidate: IceCandidate,
    },
    IceCandidatesRemoved {
        candidates: Vec<IceCandidate>,
    },
    ConnectionStateChanged {
        state: PeerConnectionState,
    },
    RemoteTrackAdded {
        track: TrackHandle,
    },
}

/// Diagnostic carried by adapter-level failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct MediaEngineError {
    pub message: String,
}

impl MediaEngineError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, MediaEngineError>;

#[async_trait]
pub trait MediaEngineAdapter: Send + Sync {
    /// Create a peer connection. Events for this peer are delivered on `events`.
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<MediaEngineEvent>,
    ) -> EngineResult<PeerHandle>;

    async fn create_offer(
        &self,
        peer: PeerHandle,
        constraints: &MediaConstraints,
    ) -> EngineResult<String>;

    async fn create_answer(
        &self,
        peer: PeerHandle,
        constraints: &MediaConstraints,
    ) -> EngineResult<String>;

    async fn set_local_description(
        &self,
        peer: PeerHandle,
        sdp: &str,
        kind: SdpKind,
    ) -> EngineResult<()>;

    async fn set_remote_description(
        &self,
        peer: PeerHandle,
        sdp: &str,
        kind: SdpKind,
    ) -> EngineResult<()>;

    async fn add_ice_candidate(
        &self,
        peer: PeerHandle,
        candidate: &IceCandidate,
    ) -> EngineResult<()>;

    async fn add_audio_track(&self, peer: PeerHandle) -> EngineResult<TrackHandle>;

    async fn set_track_enabled(&self, track: TrackHandle, enabled: bool) -> EngineResult<()>;

    async fn send_dtmf_tone(
        &self,
        peer: PeerHandle,
        tone: char,
        duration_ms: u64,
    ) -> EngineResult<()>;

    /// Release operations must be tolerant of unknown/already-released handles.
    async fn release_track(&self, track: TrackHandle);

    async fn release_peer_connection(&self, peer: PeerHandle);

    async fn release_factory(&self);
}
