//! Media session lifecycle
//!
//! One [`MediaSessionEngine`] per call owns the peer connection, the local
//! audio track, the negotiated descriptions and the session's ICE candidate
//! set. Description operations (offer/answer/set-remote) are serialized by a
//! per-session mutex and are point-of-failure atomic: either the description
//! is accepted and session state advances, or the session is left exactly as
//! it was. ICE candidate handling is best-effort and never call-fatal.
//!
//! Disposal cancels the session token first, so any in-flight description
//! operation fails fast with [`MediaError::Disposed`] instead of hanging on
//! the underlying engine.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::interfaces::media_engine::{
    EngineResult, MediaConstraints, MediaEngineAdapter, MediaEngineEvent, PeerConnectionConfig,
    PeerConnectionState, PeerHandle, SdpKind, TrackHandle,
};
use crate::protocols::dtmf::{DtmfSender, DtmfTiming};
use crate::protocols::ice::{IceCandidate, IceCandidateStore};
use crate::protocols::sdp;

/// Session-level media connection state, mapped 1:1 from the engine's
/// peer-connection state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<PeerConnectionState> for MediaConnectionState {
    fn from(state: PeerConnectionState) -> Self {
        match state {
            PeerConnectionState::New => MediaConnectionState::New,
            PeerConnectionState::Connecting => MediaConnectionState::Connecting,
            PeerConnectionState::Connected => MediaConnectionState::Connected,
            PeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
            PeerConnectionState::Failed => MediaConnectionState::Failed,
            PeerConnectionState::Closed => MediaConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("media session not initialized")]
    NotInitialized,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("invalid SDP payload")]
    InvalidSdp,

    #[error("remote description rejected: {0}")]
    RemoteDescriptionRejected(String),

    #[error("media session disposed")]
    Disposed,
}

/// Notifications emitted by a media session.
#[derive(Debug, Clone)]
pub enum MediaSessionEvent {
    ConnectionStateChanged {
        call_id: String,
        state: MediaConnectionState,
    },
    /// Locally gathered candidate ready to be trickled over signaling.
    IceCandidateGathered {
        call_id: String,
        candidate: IceCandidate,
    },
    IceCandidatesRemoved {
        call_id: String,
        count: usize,
    },
    RemoteTrackAdded {
        call_id: String,
    },
}

/// Serialized session state touched by description operations.
struct SessionInner {
    peer: Option<PeerHandle>,
    audio_track: Option<TrackHandle>,
    audio_enabled: bool,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    event_pump: Option<JoinHandle<()>>,
    dtmf_task: Option<JoinHandle<()>>,
}

/// ICE-path state kept outside the description lock: candidate addition must
/// stay possible while an offer/answer exchange is in flight.
#[derive(Default)]
struct IcePath {
    peer: Option<PeerHandle>,
    remote_applied: bool,
    pending: Vec<IceCandidate>,
}

pub struct MediaSessionEngine {
    call_id: String,
    adapter: Arc<dyn MediaEngineAdapter>,
    peer_config: PeerConnectionConfig,
    constraints: MediaConstraints,
    dtmf_timing: DtmfTiming,

    inner: Mutex<SessionInner>,
    ice_path: StdMutex<IcePath>,
    candidates: Arc<IceCandidateStore>,
    state: Arc<StdRwLock<MediaConnectionState>>,

    cancel: CancellationToken,
    initialized: AtomicBool,
    disposed: AtomicBool,

    event_tx: mpsc::UnboundedSender<MediaSessionEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<MediaSessionEvent>>>,
}

impl MediaSessionEngine {
    pub fn new(
        call_id: String,
        adapter: Arc<dyn MediaEngineAdapter>,
        media_config: &MediaConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            call_id,
            adapter,
            peer_config: PeerConnectionConfig {
                ice_servers: media_config.ice_servers.clone(),
            },
            constraints: MediaConstraints {
                receive_audio: media_config.receive_audio,
                receive_video: media_config.receive_video,
            },
            dtmf_timing: DtmfTiming::from(&media_config.dtmf),
            inner: Mutex::new(SessionInner {
                peer: None,
                audio_track: None,
                audio_enabled: true,
                local_sdp: None,
                remote_sdp: None,
                event_pump: None,
                dtmf_task: None,
            }),
            ice_path: StdMutex::new(IcePath::default()),
            candidates: Arc::new(IceCandidateStore::new()),
            state: Arc::new(StdRwLock::new(MediaConnectionState::New)),
            cancel: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
        }
    }

    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<MediaSessionEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn connection_state(&self) -> MediaConnectionState {
        *self.state.read().unwrap()
    }

    pub fn candidates(&self) -> Arc<IceCandidateStore> {
        Arc::clone(&self.candidates)
    }

    pub async fn local_description(&self) -> Option<String> {
        self.inner.lock().await.local_sdp.clone()
    }

    pub async fn remote_description(&self) -> Option<String> {
        self.inner.lock().await.remote_sdp.clone()
    }

    /// Mark the session ready for negotiation. Idempotent.
    pub fn initialize(&self) -> Result<(), MediaError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MediaError::Disposed);
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run an adapter operation, failing fast with `Disposed` if the session
    /// is torn down while the operation is in flight. The adapter future is a
    /// one-shot completion: it resolves exactly once or is abandoned here.
    async fn run<T, F>(&self, op: F) -> Result<EngineResult<T>, MediaError>
    where
        F: Future<Output = EngineResult<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MediaError::Disposed),
            result = op => Ok(result),
        }
    }

    /// Lazily create the peer connection and start its event pump.
    async fn ensure_peer(&self, inner: &mut SessionInner) -> Result<PeerHandle, MediaError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MediaError::Disposed);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(MediaError::NotInitialized);
        }
        if let Some(peer) = inner.peer {
            return Ok(peer);
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let peer = self
            .run(self.adapter.create_peer_connection(&self.peer_config, engine_tx))
            .await?
            .map_err(|e| {
                MediaError::NegotiationFailed(format!("create peer connection: {}", e.message))
            })?;

        inner.peer = Some(peer);
        inner.event_pump = Some(self.spawn_event_pump(engine_rx));
        self.ice_path.lock().unwrap().peer = Some(peer);

        debug!("Created peer connection {:?} for call {}", peer, self.call_id);
        Ok(peer)
    }

    fn spawn_event_pump(
        &self,
        mut engine_rx: mpsc::UnboundedReceiver<MediaEngineEvent>,
    ) -> JoinHandle<()> {
        let call_id = self.call_id.clone();
        let state = Arc::clone(&self.state);
        let candidates = Arc::clone(&self.candidates);
        let event_tx = self.event_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = engine_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    MediaEngineEvent::ConnectionStateChanged { state: peer_state } => {
                        let mapped = MediaConnectionState::from(peer_state);
                        *state.write().unwrap() = mapped;
                        debug!("Call {} media connection state: {:?}", call_id, mapped);
                        let _ = event_tx.send(MediaSessionEvent::ConnectionStateChanged {
                            call_id: call_id.clone(),
                            state: mapped,
                        });
                    }
                    MediaEngineEvent::IceCandidateAdded { candidate } => {
                        if candidates.add(candidate.clone()) {
                            let _ = event_tx.send(MediaSessionEvent::IceCandidateGathered {
                                call_id: call_id.clone(),
                                candidate,
                            });
                        } else {
                            debug!("Call {}: duplicate local ICE candidate ignored", call_id);
                        }
                    }
                    MediaEngineEvent::IceCandidatesRemoved { candidates: removed } => {
                        let count = candidates.remove_all(&removed);
                        debug!("Call {}: {} ICE candidate(s) removed", call_id, count);
                        let _ = event_tx.send(MediaSessionEvent::IceCandidatesRemoved {
                            call_id: call_id.clone(),
                            count,
                        });
                    }
                    MediaEngineEvent::RemoteTrackAdded { .. } => {
                        let _ = event_tx.send(MediaSessionEvent::RemoteTrackAdded {
                            call_id: call_id.clone(),
                        });
                    }
                }
            }
        })
    }

    async fn ensure_audio_track(
        &self,
        inner: &mut SessionInner,
        peer: PeerHandle,
    ) -> Result<TrackHandle, MediaError> {
        if let Some(track) = inner.audio_track {
            return Ok(track);
        }

        let track = self
            .run(self.adapter.add_audio_track(peer))
            .await?
            .map_err(|e| MediaError::NegotiationFailed(format!("add audio track: {}", e.message)))?;

        if !inner.audio_enabled {
            // Mute requested before the track existed
            if let Err(e) = self.adapter.set_track_enabled(track, false).await {
                warn!("Call {}: failed to apply initial mute: {}", self.call_id, e);
            }
        }

        inner.audio_track = Some(track);
        Ok(track)
    }

    /// Create the local SDP offer: lazily sets up the peer connection and
    /// audio track, applies the offer as local description, sanitizes.
    pub async fn create_offer(&self) -> Result<String, MediaError> {
        let mut inner = self.inner.lock().await;
        let peer = self.ensure_peer(&mut inner).await?;
        self.ensure_audio_track(&mut inner, peer).await?;

        let offer = self
            .run(self.adapter.create_offer(peer, &self.constraints))
            .await?
            .map_err(|e| MediaError::NegotiationFailed(format!("create offer: {}", e.message)))?;

        self.run(self.adapter.set_local_description(peer, &offer, SdpKind::Offer))
            .await?
            .map_err(|e| {
                MediaError::NegotiationFailed(format!("set local offer: {}", e.message))
            })?;

        let sanitized = sdp::sanitize(&offer).map_err(|e| {
            MediaError::NegotiationFailed(format!("offer failed sanitization: {}", e))
        })?;
        if !sdp::is_well_formed(&sanitized) {
            warn!(
                "Call {}: offer kept unmodified, sanitizer could not repair it",
                self.call_id
            );
        }

        inner.local_sdp = Some(sanitized.clone());
        info!("Call {}: local offer created", self.call_id);
        Ok(sanitized)
    }

    /// Answer a remote offer.
    ///
    /// The incoming offer is sanitized before being applied. If the engine
    /// rejects the sanitized payload, the ORIGINAL offer is retried once:
    /// some malformed-but-workable SDPs are broken by normalization yet
    /// accepted natively, and a second chance is cheaper than a failed call.
    pub async fn create_answer(
        &self,
        local_identity: &str,
        offer_sdp: &str,
    ) -> Result<String, MediaError> {
        let sanitized_offer = sdp::sanitize(offer_sdp).map_err(|_| MediaError::InvalidSdp)?;
        if !sdp::is_well_formed(&sanitized_offer) {
            warn!(
                "Call {}: remote offer not repairable, using it as received",
                self.call_id
            );
        }

        let mut inner = self.inner.lock().await;
        let peer = self.ensure_peer(&mut inner).await?;
        debug!("Call {}: answering as {}", self.call_id, local_identity);

        let applied_offer = match self
            .run(self.adapter.set_remote_description(peer, &sanitized_offer, SdpKind::Offer))
            .await?
        {
            Ok(()) => sanitized_offer,
            Err(rejection) => {
                warn!(
                    "Call {}: sanitized offer rejected ({}), retrying with original payload",
                    self.call_id, rejection
                );
                self.run(self.adapter.set_remote_description(peer, offer_sdp, SdpKind::Offer))
                    .await?
                    .map_err(|e| MediaError::RemoteDescriptionRejected(e.message))?;
                offer_sdp.to_string()
            }
        };

        inner.remote_sdp = Some(applied_offer);
        self.mark_remote_applied();
        self.flush_pending_candidates(peer).await;

        self.ensure_audio_track(&mut inner, peer).await?;

        let answer = self
            .run(self.adapter.create_answer(peer, &self.constraints))
            .await?
            .map_err(|e| MediaError::NegotiationFailed(format!("create answer: {}", e.message)))?;

        self.run(self.adapter.set_local_description(peer, &answer, SdpKind::Answer))
            .await?
            .map_err(|e| {
                MediaError::NegotiationFailed(format!("set local answer: {}", e.message))
            })?;

        let sanitized_answer = sdp::sanitize(&answer).map_err(|e| {
            MediaError::NegotiationFailed(format!("answer failed sanitization: {}", e))
        })?;

        inner.local_sdp = Some(sanitized_answer.clone());
        info!("Call {}: answer created", self.call_id);
        Ok(sanitized_answer)
    }

    /// Apply a remote description. Atomic: on rejection the stored remote
    /// description is untouched.
    pub async fn set_remote_description(
        &self,
        sdp_text: &str,
        kind: SdpKind,
    ) -> Result<(), MediaError> {
        let clean = sdp::sanitize(sdp_text).map_err(|_| MediaError::InvalidSdp)?;
        if clean.trim().is_empty() {
            return Err(MediaError::InvalidSdp);
        }

        let mut inner = self.inner.lock().await;
        let peer = self.ensure_peer(&mut inner).await?;

        self.run(self.adapter.set_remote_description(peer, &clean, kind))
            .await?
            .map_err(|e| MediaError::RemoteDescriptionRejected(e.message))?;

        inner.remote_sdp = Some(clean);
        self.mark_remote_applied();
        self.flush_pending_candidates(peer).await;

        debug!("Call {}: remote {} applied", self.call_id, kind.as_str());
        Ok(())
    }

    /// Re-apply an externally modified local description (renegotiation).
    pub async fn apply_modified_sdp(&self, sdp_text: &str) -> Result<(), MediaError> {
        let clean = sdp::sanitize(sdp_text).map_err(|_| MediaError::InvalidSdp)?;

        let mut inner = self.inner.lock().await;
        let peer = self.ensure_peer(&mut inner).await?;

        self.run(self.adapter.set_local_description(peer, &clean, SdpKind::Offer))
            .await?
            .map_err(|e| {
                MediaError::NegotiationFailed(format!("apply modified SDP: {}", e.message))
            })?;

        inner.local_sdp = Some(clean);
        Ok(())
    }

    fn mark_remote_applied(&self) {
        self.ice_path.lock().unwrap().remote_applied = true;
    }

    /// Add a remote ICE candidate. Best-effort: duplicates are dropped,
    /// candidates arriving before the remote description is applied are
    /// queued, and engine-level failures are logged and swallowed. Candidates
    /// can legitimately arrive late or duplicated during renegotiation.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("Call {}: ICE candidate after dispose ignored", self.call_id);
            return;
        }

        if !self.candidates.add(candidate.clone()) {
            debug!("Call {}: duplicate ICE candidate ignored", self.call_id);
            return;
        }

        let peer = {
            let mut ice = self.ice_path.lock().unwrap();
            match (ice.peer, ice.remote_applied) {
                (Some(peer), true) => peer,
                _ => {
                    ice.pending.push(candidate);
                    debug!(
                        "Call {}: ICE candidate queued, media engine not ready",
                        self.call_id
                    );
                    return;
                }
            }
        };

        if let Err(e) = self.adapter.add_ice_candidate(peer, &candidate).await {
            warn!("Call {}: failed to add ICE candidate: {}", self.call_id, e);
        }
    }

    /// Remove candidates reported withdrawn by the remote side.
    pub fn remove_ice_candidates(&self, candidates: &[IceCandidate]) -> usize {
        let removed = self.candidates.remove_all(candidates);
        debug!("Call {}: removed {} ICE candidate(s)", self.call_id, removed);
        removed
    }

    async fn flush_pending_candidates(&self, peer: PeerHandle) {
        let pending = std::mem::take(&mut self.ice_path.lock().unwrap().pending);
        if pending.is_empty() {
            return;
        }

        debug!(
            "Call {}: flushing {} queued ICE candidate(s)",
            self.call_id,
            pending.len()
        );
        for candidate in pending {
            if let Err(e) = self.adapter.add_ice_candidate(peer, &candidate).await {
                warn!(
                    "Call {}: failed to add queued ICE candidate: {}",
                    self.call_id, e
                );
            }
        }
    }

    pub async fn set_muted(&self, muted: bool) {
        self.set_audio_enabled(!muted).await;
    }

    /// Enable or disable the local audio track. Takes effect immediately when
    /// the track exists, or at track creation otherwise. Best-effort.
    pub async fn set_audio_enabled(&self, enabled: bool) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.audio_enabled = enabled;
        if let Some(track) = inner.audio_track {
            if let Err(e) = self.adapter.set_track_enabled(track, enabled).await {
                warn!(
                    "Call {}: failed to set audio enabled={}: {}",
                    self.call_id, enabled, e
                );
            }
        }
    }

    /// Send a DTMF tone sequence, paced by the configured tone/gap timing.
    /// The sequence runs asynchronously and dies with the session.
    pub async fn send_dtmf(&self, tones: &str) -> Result<(), MediaError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MediaError::Disposed);
        }

        let mut inner = self.inner.lock().await;
        let Some(peer) = inner.peer else {
            return Err(MediaError::NotInitialized);
        };

        if let Some(previous) = inner.dtmf_task.take() {
            if !previous.is_finished() {
                debug!("Call {}: replacing in-flight DTMF sequence", self.call_id);
                previous.abort();
            }
        }

        inner.dtmf_task = Some(DtmfSender::spawn(
            self.call_id.clone(),
            tones,
            self.dtmf_timing,
            Arc::clone(&self.adapter),
            peer,
            self.cancel.child_token(),
        ));
        Ok(())
    }

    /// Tear the session down: cancel outstanding async work, then release
    /// tracks, the peer connection and the factory, in that order. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Call {}: dispose called twice", self.call_id);
            return;
        }

        info!("Disposing media session for call {}", self.call_id);
        self.cancel.cancel();

        // In-flight description operations fail fast on the cancelled token
        // and release the lock before this acquires it.
        let mut inner = self.inner.lock().await;

        if let Some(task) = inner.dtmf_task.take() {
            task.abort();
        }
        if let Some(pump) = inner.event_pump.take() {
            pump.abort();
        }
        if let Some(track) = inner.audio_track.take() {
            self.adapter.release_track(track).await;
        }
        if let Some(peer) = inner.peer.take() {
            self.adapter.release_peer_connection(peer).await;
        }
        self.adapter.release_factory().await;

        {
            let mut ice = self.ice_path.lock().unwrap();
            ice.peer = None;
            ice.remote_applied = false;
            ice.pending.clear();
        }

        *self.state.write().unwrap() = MediaConnectionState::Closed;
        let _ = self.event_tx.send(MediaSessionEvent::ConnectionStateChanged {
            call_id: self.call_id.clone(),
            state: MediaConnectionState::Closed,
        });
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tokio::sync::Notify;

    use crate::interfaces::media_engine::MediaEngineError;

    const OFFER_LF: &str = "v=0\no=- 100 1 IN IP4 10.0.0.1\ns=-\nm=audio 4000 RTP/AVP 0\n";
    const OFFER_CRLF: &str = "v=0\r\no=- 100 1 IN IP4 10.0.0.1\r\ns=-\r\nm=audio 4000 RTP/AVP 0\r\n";
    const ANSWER_LF: &str = "v=0\no=- 200 1 IN IP4 10.0.0.2\ns=-\nm=audio 5000 RTP/AVP 0\n";
    const ANSWER_CRLF: &str = "v=0\r\no=- 200 1 IN IP4 10.0.0.2\r\ns=-\r\nm=audio 5000 RTP/AVP 0\r\n";
    const REOFFER_LF: &str = "v=0\no=- 100 2 IN IP4 10.0.0.9\ns=-\nm=audio 4002 RTP/AVP 0\n";
    const REOFFER_CRLF: &str = "v=0\r\no=- 100 2 IN IP4 10.0.0.9\r\ns=-\r\nm=audio 4002 RTP/AVP 0\r\n";

    #[derive(Default)]
    struct MockBehavior {
        fail_create_offer: bool,
        /// Reject set_remote_description for these exact payloads.
        reject_remote_payloads: Vec<String>,
        /// Reject set_local_description for these exact payloads.
        reject_local_payloads: Vec<String>,
        fail_add_ice: bool,
        block_create_offer: bool,
        block_set_local: bool,
    }

    struct MockMediaEngine {
        behavior: MockBehavior,
        next_handle: AtomicU64,
        gate: Notify,
        local_applied: StdMutex<Vec<String>>,
        remote_applied: StdMutex<Vec<String>>,
        ice_received: StdMutex<Vec<IceCandidate>>,
        releases: StdMutex<Vec<&'static str>>,
        events: StdMutex<Option<mpsc::UnboundedSender<MediaEngineEvent>>>,
    }

    impl MockMediaEngine {
        fn new(behavior: MockBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                next_handle: AtomicU64::new(1),
                gate: Notify::new(),
                local_applied: StdMutex::new(Vec::new()),
                remote_applied: StdMutex::new(Vec::new()),
                ice_received: StdMutex::new(Vec::new()),
                releases: StdMutex::new(Vec::new()),
                events: StdMutex::new(None),
            })
        }

        fn emit(&self, event: MediaEngineEvent) {
            let events = self.events.lock().unwrap();
            events.as_ref().unwrap().send(event).unwrap();
        }
    }

    #[async_trait]
    impl MediaEngineAdapter for MockMediaEngine {
        async fn create_peer_connection(
            &self,
            _config: &PeerConnectionConfig,
            events: mpsc::UnboundedSender<MediaEngineEvent>,
        ) -> EngineResult<PeerHandle> {
            *self.events.lock().unwrap() = Some(events);
            Ok(PeerHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        async fn create_offer(
            &self,
            _peer: PeerHandle,
            _constraints: &MediaConstraints,
        ) -> EngineResult<String> {
            if self.behavior.block_create_offer {
                self.gate.notified().await;
            }
            if self.behavior.fail_create_offer {
                return Err(MediaEngineError::new("offer creation failed"));
            }
            Ok(OFFER_LF.to_string())
        }

        async fn create_answer(
            &self,
            _peer: PeerHandle,
            _constraints: &MediaConstraints,
        ) -> EngineResult<String> {
            Ok(ANSWER_LF.to_string())
        }

        async fn set_local_description(
            &self,
            _peer: PeerHandle,
            sdp: &str,
            _kind: SdpKind,
        ) -> EngineResult<()> {
            if self.behavior.block_set_local {
                self.gate.notified().await;
            }
            if self
                .behavior
                .reject_local_payloads
                .iter()
                .any(|rejected| rejected == sdp)
            {
                return Err(MediaEngineError::new("local description rejected"));
            }
            self.local_applied.lock().unwrap().push(sdp.to_string());
            Ok(())
        }

        async fn set_remote_description(
            &self,
            _peer: PeerHandle,
            sdp: &str,
            _kind: SdpKind,
        ) -> EngineResult<()> {
            if self
                .behavior
                .reject_remote_payloads
                .iter()
                .any(|rejected| rejected == sdp)
            {
                return Err(MediaEngineError::new("incompatible description"));
            }
            self.remote_applied.lock().unwrap().push(sdp.to_string());
            Ok(())
        }

        async fn add_ice_candidate(
            &self,
            _peer: PeerHandle,
            candidate: &IceCandidate,
        ) -> EngineResult<()> {
            if self.behavior.fail_add_ice {
                return Err(MediaEngineError::new("ice add failed"));
            }
            self.ice_received.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        async fn add_audio_track(&self, _peer: PeerHandle) -> EngineResult<TrackHandle> {
            Ok(TrackHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        async fn set_track_enabled(
            &self,
            _track: TrackHandle,
            _enabled: bool,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn send_dtmf_tone(
            &self,
            _peer: PeerHandle,
            _tone: char,
            _duration_ms: u64,
        ) -> EngineResult<()> {
            Ok(())
        }

        async fn release_track(&self, _track: TrackHandle) {
            self.releases.lock().unwrap().push("track");
        }

        async fn release_peer_connection(&self, _peer: PeerHandle) {
            self.releases.lock().unwrap().push("peer");
        }

        async fn release_factory(&self) {
            self.releases.lock().unwrap().push("factory");
        }
    }

    fn engine(adapter: Arc<MockMediaEngine>) -> MediaSessionEngine {
        MediaSessionEngine::new(
            "call-1".to_string(),
            adapter as Arc<dyn MediaEngineAdapter>,
            &crate::config::MediaConfig::default(),
        )
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{} 1 udp 1 10.0.0.{} 4000 typ host", n, n),
            Some("audio".to_string()),
            Some(0),
        )
    }

    #[tokio::test]
    async fn test_create_offer_sanitizes_and_stores_local_description() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();

        let offer = session.create_offer().await.unwrap();
        assert_eq!(offer, OFFER_CRLF);
        assert_eq!(session.local_description().await, Some(OFFER_CRLF.to_string()));
    }

    #[tokio::test]
    async fn test_create_offer_before_initialize_fails() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(adapter);

        assert_eq!(session.create_offer().await, Err(MediaError::NotInitialized));
    }

    #[tokio::test]
    async fn test_failed_offer_leaves_session_unchanged() {
        let adapter = MockMediaEngine::new(MockBehavior {
            fail_create_offer: true,
            ..Default::default()
        });
        let session = engine(adapter);
        session.initialize().unwrap();

        let result = session.create_offer().await;
        assert!(matches!(result, Err(MediaError::NegotiationFailed(_))));
        assert_eq!(session.local_description().await, None);
    }

    #[tokio::test]
    async fn test_set_remote_description_blank_is_invalid() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(adapter);
        session.initialize().unwrap();

        assert_eq!(
            session.set_remote_description("   ", SdpKind::Answer).await,
            Err(MediaError::InvalidSdp)
        );
    }

    #[tokio::test]
    async fn test_rejected_remote_description_is_atomic() {
        let adapter = MockMediaEngine::new(MockBehavior {
            reject_remote_payloads: vec![ANSWER_CRLF.to_string(), ANSWER_LF.to_string()],
            ..Default::default()
        });
        let session = engine(adapter);
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        let result = session
            .set_remote_description(ANSWER_LF, SdpKind::Answer)
            .await;
        assert!(matches!(
            result,
            Err(MediaError::RemoteDescriptionRejected(_))
        ));
        // Pre-call value survives the rejection
        assert_eq!(session.remote_description().await, None);
    }

    #[tokio::test]
    async fn test_create_answer_happy_path() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();

        let answer = session
            .create_answer("sip:alice@example.com", OFFER_LF)
            .await
            .unwrap();
        assert_eq!(answer, ANSWER_CRLF);
        // The sanitized offer was applied as remote description
        assert_eq!(session.remote_description().await, Some(OFFER_CRLF.to_string()));
        assert_eq!(
            adapter.remote_applied.lock().unwrap().as_slice(),
            &[OFFER_CRLF.to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_answer_retries_with_original_offer() {
        // Engine rejects the sanitized form but accepts the raw payload
        let adapter = MockMediaEngine::new(MockBehavior {
            reject_remote_payloads: vec![OFFER_CRLF.to_string()],
            ..Default::default()
        });
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();

        let answer = session
            .create_answer("sip:alice@example.com", OFFER_LF)
            .await
            .unwrap();
        assert_eq!(answer, ANSWER_CRLF);
        assert_eq!(session.remote_description().await, Some(OFFER_LF.to_string()));
        assert_eq!(
            adapter.remote_applied.lock().unwrap().as_slice(),
            &[OFFER_LF.to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_answer_gives_up_after_retry() {
        let adapter = MockMediaEngine::new(MockBehavior {
            reject_remote_payloads: vec![OFFER_CRLF.to_string(), OFFER_LF.to_string()],
            ..Default::default()
        });
        let session = engine(adapter);
        session.initialize().unwrap();

        let result = session.create_answer("sip:alice@example.com", OFFER_LF).await;
        assert!(matches!(
            result,
            Err(MediaError::RemoteDescriptionRejected(_))
        ));
        assert_eq!(session.remote_description().await, None);
    }

    #[tokio::test]
    async fn test_apply_modified_sdp_replaces_local_description() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        session.apply_modified_sdp(REOFFER_LF).await.unwrap();
        assert_eq!(
            session.local_description().await,
            Some(REOFFER_CRLF.to_string())
        );
        // The sanitized form is what reached the engine
        assert_eq!(
            adapter.local_applied.lock().unwrap().last().map(String::as_str),
            Some(REOFFER_CRLF)
        );
    }

    #[tokio::test]
    async fn test_apply_modified_sdp_rejection_is_atomic() {
        let adapter = MockMediaEngine::new(MockBehavior {
            reject_local_payloads: vec![REOFFER_CRLF.to_string()],
            ..Default::default()
        });
        let session = engine(adapter);
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        let result = session.apply_modified_sdp(REOFFER_LF).await;
        assert!(matches!(result, Err(MediaError::NegotiationFailed(_))));
        // Pre-call value survives the rejection
        assert_eq!(
            session.local_description().await,
            Some(OFFER_CRLF.to_string())
        );
    }

    #[tokio::test]
    async fn test_apply_modified_sdp_blank_is_invalid() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(adapter);
        session.initialize().unwrap();

        assert_eq!(
            session.apply_modified_sdp("   ").await,
            Err(MediaError::InvalidSdp)
        );
    }

    #[tokio::test]
    async fn test_dispose_fails_in_flight_sdp_update_fast() {
        let adapter = MockMediaEngine::new(MockBehavior {
            block_set_local: true,
            ..Default::default()
        });
        let session = Arc::new(engine(adapter));
        session.initialize().unwrap();

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.apply_modified_sdp(REOFFER_LF).await })
        };

        // Let the update reach the blocking adapter call, then tear down
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.dispose().await;

        assert_eq!(in_flight.await.unwrap(), Err(MediaError::Disposed));
    }

    #[tokio::test]
    async fn test_ice_candidates_queue_until_remote_applied() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        // Remote description not applied yet: candidate is queued, not pushed
        session.add_ice_candidate(candidate(1)).await;
        assert!(adapter.ice_received.lock().unwrap().is_empty());
        assert_eq!(session.candidates().len(), 1);

        session
            .set_remote_description(ANSWER_LF, SdpKind::Answer)
            .await
            .unwrap();
        assert_eq!(adapter.ice_received.lock().unwrap().len(), 1);

        // Candidates after readiness go straight through
        session.add_ice_candidate(candidate(2)).await;
        assert_eq!(adapter.ice_received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ice_candidate_ignored() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();
        session.create_offer().await.unwrap();
        session
            .set_remote_description(ANSWER_LF, SdpKind::Answer)
            .await
            .unwrap();

        session.add_ice_candidate(candidate(1)).await;
        session.add_ice_candidate(candidate(1)).await;

        assert_eq!(adapter.ice_received.lock().unwrap().len(), 1);
        assert_eq!(session.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_ice_engine_failure_is_swallowed() {
        let adapter = MockMediaEngine::new(MockBehavior {
            fail_add_ice: true,
            ..Default::default()
        });
        let session = engine(adapter);
        session.initialize().unwrap();
        session.create_offer().await.unwrap();
        session
            .set_remote_description(ANSWER_LF, SdpKind::Answer)
            .await
            .unwrap();

        // No error surfaces; the candidate stays recorded for the session
        session.add_ice_candidate(candidate(1)).await;
        assert_eq!(session.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_releases_in_fixed_order_and_is_idempotent() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        session.dispose().await;
        session.dispose().await;

        assert_eq!(
            adapter.releases.lock().unwrap().as_slice(),
            &["track", "peer", "factory"]
        );
        assert_eq!(session.connection_state(), MediaConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_dispose_fails_in_flight_operation_fast() {
        let adapter = MockMediaEngine::new(MockBehavior {
            block_create_offer: true,
            ..Default::default()
        });
        let session = Arc::new(engine(adapter));
        session.initialize().unwrap();

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.create_offer().await })
        };

        // Let the offer reach the blocking adapter call, then tear down
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.dispose().await;

        assert_eq!(in_flight.await.unwrap(), Err(MediaError::Disposed));
    }

    #[tokio::test]
    async fn test_operations_after_dispose_fail() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(adapter);
        session.initialize().unwrap();
        session.dispose().await;

        assert_eq!(session.create_offer().await, Err(MediaError::Disposed));
        assert_eq!(
            session.apply_modified_sdp(REOFFER_LF).await,
            Err(MediaError::Disposed)
        );
        assert_eq!(session.send_dtmf("1").await, Err(MediaError::Disposed));
    }

    #[tokio::test]
    async fn test_connection_state_events_mapped_one_to_one() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        let mut events = session.take_event_receiver().unwrap();
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        adapter.emit(MediaEngineEvent::ConnectionStateChanged {
            state: PeerConnectionState::Connected,
        });

        match events.recv().await.unwrap() {
            MediaSessionEvent::ConnectionStateChanged { state, .. } => {
                assert_eq!(state, MediaConnectionState::Connected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(session.connection_state(), MediaConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_locally_gathered_candidates_stored_and_emitted() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(Arc::clone(&adapter));
        let mut events = session.take_event_receiver().unwrap();
        session.initialize().unwrap();
        session.create_offer().await.unwrap();

        adapter.emit(MediaEngineEvent::IceCandidateAdded {
            candidate: candidate(7),
        });

        match events.recv().await.unwrap() {
            MediaSessionEvent::IceCandidateGathered { candidate: c, .. } => {
                assert_eq!(c, candidate(7));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(session.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_send_dtmf_requires_peer() {
        let adapter = MockMediaEngine::new(MockBehavior::default());
        let session = engine(adapter);
        session.initialize().unwrap();

        assert_eq!(session.send_dtmf("123").await, Err(MediaError::NotInitialized));

        session.create_offer().await.unwrap();
        assert!(session.send_dtmf("123").await.is_ok());
    }
}
