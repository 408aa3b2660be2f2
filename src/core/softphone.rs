//! Softphone core orchestrator
//!
//! [`SoftphoneCore`] wires the pieces together: it consumes [`SignalingEvent`]s
//! from the embedder's SIP transport, drives the call state machine and the
//! per-call media sessions, and emits [`SoftphoneEvent`]s back to the embedder.
//! One media session per call id lives in a concurrent map; the signaling loop
//! and a periodic retention pass run as background tasks between `start()` and
//! `stop()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SoftphoneConfig;
use crate::interfaces::clock::Clock;
use crate::interfaces::media_engine::{MediaEngineAdapter, SdpKind};
use crate::interfaces::persistence::PersistenceAdapter;
use crate::protocols::ice::IceCandidate;
use crate::services::accounts::{AccountRegistry, RegistrationError, RegistrationState};
use crate::services::call_state::{
    CallDirection, CallErrorReason, CallSession, CallState, CallStateMachine,
};
use crate::services::media_session::{
    MediaConnectionState, MediaSessionEngine, MediaSessionEvent,
};
use crate::services::repository::{
    AccountPatch, CallOutcome, CallSessionRepository, RetentionLimits,
};
use crate::{Error, Result};

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// SIP-side happenings, produced by the embedder's signaling transport.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    IncomingInvite {
        call_id: String,
        account_key: String,
        from: String,
        to: String,
        offer_sdp: String,
        from_tag: Option<String>,
        to_tag: Option<String>,
        cseq: Option<u32>,
    },
    RemoteRinging {
        call_id: String,
    },
    RemoteAnswered {
        call_id: String,
        answer_sdp: String,
    },
    RemoteAck {
        call_id: String,
    },
    RemoteBye {
        call_id: String,
    },
    RemoteCancel {
        call_id: String,
    },
    IceCandidate {
        call_id: String,
        candidate: IceCandidate,
    },
    IceCandidatesRemoved {
        call_id: String,
        candidates: Vec<IceCandidate>,
    },
    RegistrationOk {
        account_key: String,
        expires_in_secs: u32,
    },
    RegistrationFailed {
        account_key: String,
        reason: String,
    },
}

/// Notifications to the embedding application.
#[derive(Debug, Clone)]
pub enum SoftphoneEvent {
    IncomingCall {
        call_id: String,
        account_key: String,
        from: String,
        to: String,
    },
    CallStateChanged {
        call_id: String,
        state: CallState,
        reason: CallErrorReason,
    },
    MediaConnectionChanged {
        call_id: String,
        state: MediaConnectionState,
    },
    /// Locally gathered ICE candidate, ready to trickle over signaling.
    IceCandidateReady {
        call_id: String,
        candidate: IceCandidate,
    },
    RegistrationChanged {
        account_key: String,
        state: RegistrationState,
    },
    Error {
        call_id: Option<String>,
        message: String,
    },
}

pub struct SoftphoneCore {
    config: SoftphoneConfig,
    adapter: Arc<dyn MediaEngineAdapter>,
    clock: Arc<dyn Clock>,

    repository: Arc<CallSessionRepository>,
    registry: Arc<AccountRegistry>,
    state_machine: Arc<CallStateMachine>,

    sessions: DashMap<String, Arc<MediaSessionEngine>>,
    // Incoming offers held until accept_call; remote SDP only reaches the
    // session record through the media engine.
    pending_offers: DashMap<String, String>,
    // One guard per call id, held across the state check, the terminal
    // transition and finalize_call. Local hangup and the signaling loop can
    // race on the same call; the loser of the guard sees the terminal state.
    teardown_locks: DashMap<String, Arc<AsyncMutex<()>>>,

    running: AtomicBool,
    cancel: CancellationToken,

    event_tx: mpsc::UnboundedSender<SoftphoneEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<SoftphoneEvent>>>,
    signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    signaling_rx: StdMutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl SoftphoneCore {
    pub fn new(
        config: SoftphoneConfig,
        adapter: Arc<dyn MediaEngineAdapter>,
        store: Arc<dyn PersistenceAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let repository = Arc::new(CallSessionRepository::new(store, Arc::clone(&clock)));
        let registry = Arc::new(AccountRegistry::new(Arc::clone(&clock)));
        let state_machine = Arc::new(CallStateMachine::new(
            Arc::clone(&repository),
            Arc::clone(&clock),
        ));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            adapter,
            clock,
            repository,
            registry,
            state_machine,
            sessions: DashMap::new(),
            pending_offers: DashMap::new(),
            teardown_locks: DashMap::new(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            signaling_tx,
            signaling_rx: StdMutex::new(Some(signaling_rx)),
        })
    }

    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SoftphoneEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Sender for the embedder's signaling transport to push events into.
    pub fn signaling_sender(&self) -> mpsc::UnboundedSender<SignalingEvent> {
        self.signaling_tx.clone()
    }

    pub fn repository(&self) -> Arc<CallSessionRepository> {
        Arc::clone(&self.repository)
    }

    pub fn registry(&self) -> Arc<AccountRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn state_machine(&self) -> Arc<CallStateMachine> {
        Arc::clone(&self.state_machine)
    }

    pub fn active_calls(&self) -> usize {
        self.sessions.len()
    }

    // ---- Lifecycle ------------------------------------------------------

    /// Start the signaling loop and the periodic retention pass.
    ///
    /// The core runs one lifecycle per instance: `stop()` cancels the shared
    /// token and the signaling receiver is consumed here, so a stopped core
    /// cannot be started again. Build a fresh core for a new lifecycle.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::invalid_state(
                "softphone core cannot be restarted after stop",
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("softphone core already started"));
        }
        let Some(mut signaling_rx) = self.signaling_rx.lock().unwrap().take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::invalid_state("signaling receiver already consumed"));
        };

        info!(
            "Starting softphone core {} ({})",
            self.config.general.instance_id, self.config.general.user_agent
        );

        let core = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = core.cancel.cancelled() => break,
                    event = signaling_rx.recv() => match event {
                        Some(event) => core.handle_signaling_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("Signaling loop stopped");
        });

        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = core.cancel.cancelled() => break,
                    _ = ticker.tick() => core.run_retention_pass().await,
                }
            }
            debug!("Retention loop stopped");
        });

        Ok(())
    }

    /// Stop background tasks and dispose every active media session.
    /// Stopping is final for this instance; a later `start()` fails.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping softphone core");
        self.cancel.cancel();

        let call_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for call_id in call_ids {
            if let Some((_, engine)) = self.sessions.remove(&call_id) {
                engine.dispose().await;
            }
        }
        self.pending_offers.clear();
        self.teardown_locks.clear();
    }

    async fn run_retention_pass(&self) {
        if let Err(e) = self
            .repository
            .cleanup_old_data(self.config.storage.retention_days)
            .await
        {
            warn!("Retention cleanup failed: {}", e);
        }
        let limits = RetentionLimits::from(&self.config.storage);
        if let Err(e) = self.repository.keep_only_recent_data(&limits).await {
            warn!("Retention trim failed: {}", e);
        }
    }

    // ---- Accounts -------------------------------------------------------

    /// Create or update an account and make it available for calls.
    /// Registration itself is driven by the embedder's signaling transport
    /// reporting RegistrationOk/RegistrationFailed.
    pub async fn add_account(
        &self,
        username: &str,
        domain: &str,
        password: Option<String>,
        display_name: Option<String>,
    ) -> Result<String> {
        let account = self
            .repository
            .upsert_account(
                username,
                domain,
                AccountPatch {
                    password,
                    display_name,
                    ..Default::default()
                },
            )
            .await?;
        let key = account.key();
        self.registry.upsert(account);
        Ok(key)
    }

    // ---- Call control ---------------------------------------------------

    /// Originate a call on `account_key`. Returns the new call id; the local
    /// offer is stored on the session and surfaced to signaling by the caller
    /// reading `local_sdp`.
    pub async fn place_call(&self, account_key: &str, callee: &str) -> Result<String> {
        if !self.registry.is_registered(account_key) {
            return Err(RegistrationError::NotRegistered.into());
        }
        self.check_call_capacity()?;

        let call_id = Uuid::new_v4().to_string();
        let identity = self
            .registry
            .local_identity(account_key)
            .unwrap_or_else(|| account_key.to_string());
        let now = self.clock.now();

        let mut session = CallSession::new(
            call_id.clone(),
            account_key.to_string(),
            CallDirection::Outgoing,
            identity,
            callee.to_string(),
            now,
        );
        session.set_from_tag(generate_tag(12));
        session.via_branch = Some(format!("z9hG4bK{}", generate_tag(16)));
        session.record_cseq(1);
        self.repository.create_session(session).await?;

        let engine = self.create_media_session(&call_id)?;
        match engine.create_offer().await {
            Ok(offer) => {
                if let Some(mut session) = self.repository.get_session(&call_id).await? {
                    session.local_sdp = Some(offer);
                    self.repository.update_session(session).await?;
                }
                self.set_state(&call_id, CallState::Negotiating, CallErrorReason::None, None, None)
                    .await?;
                info!("Placed call {} from {} to {}", call_id, account_key, callee);
                Ok(call_id)
            }
            Err(e) => {
                let detail = e.to_string();
                self.fail_call(&call_id, CallErrorReason::MediaFailure, &detail)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Accept a ringing incoming call: answers the held offer and returns the
    /// answer SDP for the signaling transport to send.
    pub async fn accept_call(&self, call_id: &str) -> Result<String> {
        let session = self
            .repository
            .get_session(call_id)
            .await?
            .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;
        let engine = self.engine(call_id)?;
        let offer = self
            .pending_offers
            .get(call_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::signaling(format!("No pending offer for call {}", call_id)))?;

        let identity = self
            .registry
            .local_identity(&session.account_key)
            .unwrap_or_else(|| session.to.clone());

        match engine.create_answer(&identity, &offer).await {
            Ok(answer) => {
                self.pending_offers.remove(call_id);
                let mut session = session;
                session.local_sdp = Some(answer.clone());
                session.remote_sdp = engine.remote_description().await;
                self.repository.update_session(session).await?;
                self.set_state(call_id, CallState::Negotiating, CallErrorReason::None, None, None)
                    .await?;
                info!("Accepted call {}", call_id);
                Ok(answer)
            }
            Err(e) => {
                let detail = e.to_string();
                self.fail_call(call_id, CallErrorReason::MediaFailure, &detail)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Decline a ringing incoming call.
    pub async fn reject_call(&self, call_id: &str) -> Result<()> {
        let lock = self.teardown_lock(call_id);
        let _guard = lock.lock().await;
        if self.repository.get_session(call_id).await?.is_none() {
            return Err(Error::CallNotFound(call_id.to_string()));
        }
        if self.state_machine.current_state(call_id).await?.is_terminal() {
            return Err(Error::invalid_state(format!(
                "call {} already ended",
                call_id
            )));
        }

        self.repository
            .set_call_end_time(call_id, self.clock.now())
            .await?;
        self.set_state(
            call_id,
            CallState::Ended,
            CallErrorReason::Rejected,
            Some(603),
            Some("Decline"),
        )
        .await?;
        self.finalize_call(call_id, CallOutcome::Declined).await;
        Ok(())
    }

    /// Terminate a call locally. Connected/held calls log as successful,
    /// anything still being set up logs as aborted.
    pub async fn hangup(&self, call_id: &str) -> Result<()> {
        let lock = self.teardown_lock(call_id);
        let _guard = lock.lock().await;
        let state = self.state_machine.current_state(call_id).await?;
        if !self.sessions.contains_key(call_id) && state == CallState::Idle {
            return Err(Error::CallNotFound(call_id.to_string()));
        }
        if state.is_terminal() {
            return Err(Error::invalid_state(format!(
                "call {} already ended",
                call_id
            )));
        }

        let outcome = match state {
            CallState::Connected | CallState::Holding => CallOutcome::Success,
            _ => CallOutcome::Aborted,
        };

        self.state_machine.end_call(call_id, self.clock.now()).await?;
        let _ = self.event_tx.send(SoftphoneEvent::CallStateChanged {
            call_id: call_id.to_string(),
            state: CallState::Ended,
            reason: CallErrorReason::None,
        });
        self.finalize_call(call_id, outcome).await;
        Ok(())
    }

    pub async fn hold(&self, call_id: &str) -> Result<()> {
        let state = self.state_machine.current_state(call_id).await?;
        if state != CallState::Connected {
            return Err(Error::invalid_state(format!(
                "cannot hold call {} in state {:?}",
                call_id, state
            )));
        }
        let engine = self.engine(call_id)?;
        engine.set_audio_enabled(false).await;
        self.set_state(call_id, CallState::Holding, CallErrorReason::None, None, None)
            .await
    }

    pub async fn resume(&self, call_id: &str) -> Result<()> {
        let state = self.state_machine.current_state(call_id).await?;
        if state != CallState::Holding {
            return Err(Error::invalid_state(format!(
                "cannot resume call {} in state {:?}",
                call_id, state
            )));
        }
        let engine = self.engine(call_id)?;
        engine.set_audio_enabled(true).await;
        self.set_state(call_id, CallState::Connected, CallErrorReason::None, None, None)
            .await
    }

    pub async fn send_dtmf(&self, call_id: &str, tones: &str) -> Result<()> {
        let engine = self.engine(call_id)?;
        engine.send_dtmf(tones).await.map_err(Error::from)
    }

    pub async fn set_muted(&self, call_id: &str, muted: bool) -> Result<()> {
        let engine = self.engine(call_id)?;
        engine.set_muted(muted).await;
        Ok(())
    }

    /// Re-apply an externally edited local description, e.g. after the
    /// embedder rewrote connection lines for renegotiation. The session
    /// record picks up the committed description on success.
    pub async fn apply_modified_sdp(&self, call_id: &str, sdp_text: &str) -> Result<()> {
        let engine = self.engine(call_id)?;
        engine.apply_modified_sdp(sdp_text).await?;
        if let Some(mut session) = self.repository.get_session(call_id).await? {
            session.local_sdp = engine.local_description().await;
            self.repository.update_session(session).await?;
        }
        Ok(())
    }

    // ---- Signaling event handling ---------------------------------------

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingInvite {
                call_id,
                account_key,
                from,
                to,
                offer_sdp,
                from_tag,
                to_tag,
                cseq,
            } => {
                self.handle_incoming_invite(
                    call_id,
                    account_key,
                    from,
                    to,
                    offer_sdp,
                    from_tag,
                    to_tag,
                    cseq,
                )
                .await;
            }
            SignalingEvent::RemoteRinging { call_id } => {
                if let Err(e) = self
                    .set_state(&call_id, CallState::Ringing, CallErrorReason::None, None, None)
                    .await
                {
                    warn!("Failed to record ringing for call {}: {}", call_id, e);
                }
            }
            SignalingEvent::RemoteAnswered { call_id, answer_sdp } => {
                self.handle_remote_answered(&call_id, &answer_sdp).await;
            }
            SignalingEvent::RemoteAck { call_id } => {
                self.handle_remote_ack(&call_id).await;
            }
            SignalingEvent::RemoteBye { call_id } => {
                self.handle_remote_bye(&call_id).await;
            }
            SignalingEvent::RemoteCancel { call_id } => {
                self.handle_remote_cancel(&call_id).await;
            }
            SignalingEvent::IceCandidate { call_id, candidate } => {
                match self.engine(&call_id) {
                    Ok(engine) => engine.add_ice_candidate(candidate).await,
                    Err(_) => debug!("ICE candidate for unknown call {} dropped", call_id),
                }
            }
            SignalingEvent::IceCandidatesRemoved { call_id, candidates } => {
                if let Ok(engine) = self.engine(&call_id) {
                    engine.remove_ice_candidates(&candidates);
                }
            }
            SignalingEvent::RegistrationOk {
                account_key,
                expires_in_secs,
            } => {
                self.handle_registration_result(
                    &account_key,
                    RegistrationState::Registered,
                    Some(expires_in_secs),
                    None,
                )
                .await;
            }
            SignalingEvent::RegistrationFailed { account_key, reason } => {
                self.handle_registration_result(
                    &account_key,
                    RegistrationState::Failed,
                    None,
                    Some(reason),
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_incoming_invite(
        &self,
        call_id: String,
        account_key: String,
        from: String,
        to: String,
        offer_sdp: String,
        from_tag: Option<String>,
        to_tag: Option<String>,
        cseq: Option<u32>,
    ) {
        if self.sessions.contains_key(&call_id) {
            debug!("Duplicate INVITE for call {} ignored", call_id);
            return;
        }
        if let Err(e) = self.check_call_capacity() {
            warn!("Rejecting incoming call {}: {}", call_id, e);
            let _ = self.event_tx.send(SoftphoneEvent::Error {
                call_id: Some(call_id),
                message: e.to_string(),
            });
            return;
        }

        let mut session = CallSession::new(
            call_id.clone(),
            account_key.clone(),
            CallDirection::Incoming,
            from.clone(),
            to.clone(),
            self.clock.now(),
        );
        session.set_invite_tags(from_tag, to_tag);
        if let Some(cseq) = cseq {
            session.record_cseq(cseq);
        }

        if let Err(e) = self.repository.create_session(session).await {
            error!("Failed to persist incoming call {}: {}", call_id, e);
            return;
        }

        if let Err(e) = self.create_media_session(&call_id) {
            error!("Failed to set up media for call {}: {}", call_id, e);
            return;
        }
        self.pending_offers.insert(call_id.clone(), offer_sdp);

        if let Err(e) = self
            .set_state(&call_id, CallState::Ringing, CallErrorReason::None, None, None)
            .await
        {
            warn!("Failed to record ringing for call {}: {}", call_id, e);
        }

        info!("Incoming call {} from {} on {}", call_id, from, account_key);
        let _ = self.event_tx.send(SoftphoneEvent::IncomingCall {
            call_id,
            account_key,
            from,
            to,
        });
    }

    async fn handle_remote_answered(&self, call_id: &str, answer_sdp: &str) {
        let engine = match self.engine(call_id) {
            Ok(engine) => engine,
            Err(_) => {
                warn!("Answer for unknown call {} dropped", call_id);
                return;
            }
        };

        match engine.set_remote_description(answer_sdp, SdpKind::Answer).await {
            Ok(()) => {
                match self.repository.get_session(call_id).await {
                    Ok(Some(mut session)) => {
                        session.remote_sdp = engine.remote_description().await;
                        if let Err(e) = self.repository.update_session(session).await {
                            warn!("Failed to store remote SDP for call {}: {}", call_id, e);
                        }
                    }
                    Ok(None) => debug!("No session record for answered call {}", call_id),
                    Err(e) => warn!("Failed to load session for call {}: {}", call_id, e),
                }
                if let Err(e) = self
                    .set_state(call_id, CallState::Connected, CallErrorReason::None, None, None)
                    .await
                {
                    warn!("Failed to record connect for call {}: {}", call_id, e);
                }
            }
            Err(e) => {
                let detail = e.to_string();
                self.fail_call(call_id, CallErrorReason::MediaFailure, &detail)
                    .await;
            }
        }
    }

    async fn handle_remote_ack(&self, call_id: &str) {
        match self.state_machine.current_state(call_id).await {
            Ok(CallState::Negotiating) => {
                if let Err(e) = self
                    .set_state(call_id, CallState::Connected, CallErrorReason::None, None, None)
                    .await
                {
                    warn!("Failed to record connect for call {}: {}", call_id, e);
                }
            }
            Ok(state) => debug!("ACK for call {} in state {:?} ignored", call_id, state),
            Err(e) => warn!("Failed to load state for call {}: {}", call_id, e),
        }
    }

    async fn handle_remote_bye(&self, call_id: &str) {
        let lock = self.teardown_lock(call_id);
        let _guard = lock.lock().await;
        let state = match self.state_machine.current_state(call_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("BYE for call {}: {}", call_id, e);
                return;
            }
        };
        if state.is_terminal() {
            debug!("BYE for already-ended call {} ignored", call_id);
            return;
        }
        let outcome = match state {
            CallState::Connected | CallState::Holding => CallOutcome::Success,
            _ => CallOutcome::Aborted,
        };

        if let Err(e) = self.state_machine.end_call(call_id, self.clock.now()).await {
            warn!("Failed to end call {}: {}", call_id, e);
        }
        let _ = self.event_tx.send(SoftphoneEvent::CallStateChanged {
            call_id: call_id.to_string(),
            state: CallState::Ended,
            reason: CallErrorReason::None,
        });
        self.finalize_call(call_id, outcome).await;
    }

    async fn handle_remote_cancel(&self, call_id: &str) {
        let lock = self.teardown_lock(call_id);
        let _guard = lock.lock().await;
        match self.state_machine.current_state(call_id).await {
            Ok(state) if state.is_terminal() => {
                debug!("CANCEL for already-ended call {} ignored", call_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("CANCEL for call {}: {}", call_id, e);
                return;
            }
        }
        if let Err(e) = self
            .repository
            .set_call_end_time(call_id, self.clock.now())
            .await
        {
            warn!("Failed to set end time for call {}: {}", call_id, e);
        }
        if let Err(e) = self
            .set_state(
                call_id,
                CallState::Ended,
                CallErrorReason::Cancelled,
                Some(487),
                Some("Request Terminated"),
            )
            .await
        {
            warn!("Failed to record cancel for call {}: {}", call_id, e);
        }
        self.finalize_call(call_id, CallOutcome::Missed).await;
    }

    async fn handle_registration_result(
        &self,
        account_key: &str,
        state: RegistrationState,
        expires_in_secs: Option<u32>,
        reason: Option<String>,
    ) {
        if !self
            .registry
            .set_registration_state(account_key, state, expires_in_secs)
        {
            warn!("Registration result for unknown account {}", account_key);
            return;
        }

        let expiry = self
            .registry
            .get(account_key)
            .and_then(|account| account.registration_expiry);
        if let Err(e) = self
            .repository
            .update_registration_state(account_key, state, expiry)
            .await
        {
            debug!("Failed to persist registration state for {}: {}", account_key, e);
        }

        if let Some(reason) = reason {
            warn!("Registration failed for {}: {}", account_key, reason);
            let _ = self.event_tx.send(SoftphoneEvent::Error {
                call_id: None,
                message: format!("registration failed for {}: {}", account_key, reason),
            });
        }
        let _ = self.event_tx.send(SoftphoneEvent::RegistrationChanged {
            account_key: account_key.to_string(),
            state,
        });
    }

    // ---- Internals ------------------------------------------------------

    fn check_call_capacity(&self) -> Result<()> {
        let max = self.config.general.max_concurrent_calls as usize;
        if self.sessions.len() >= max {
            return Err(Error::invalid_state(format!(
                "maximum concurrent calls reached ({})",
                max
            )));
        }
        Ok(())
    }

    fn create_media_session(&self, call_id: &str) -> Result<Arc<MediaSessionEngine>> {
        let engine = Arc::new(MediaSessionEngine::new(
            call_id.to_string(),
            Arc::clone(&self.adapter),
            &self.config.media,
        ));
        engine.initialize()?;
        self.spawn_media_pump(&engine);
        self.sessions.insert(call_id.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    /// Forward media session events to the embedder's event stream.
    fn spawn_media_pump(&self, engine: &Arc<MediaSessionEngine>) {
        let Some(mut media_rx) = engine.take_event_receiver() else {
            return;
        };
        let event_tx = self.event_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = media_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    MediaSessionEvent::ConnectionStateChanged { call_id, state } => {
                        let _ = event_tx.send(SoftphoneEvent::MediaConnectionChanged {
                            call_id,
                            state,
                        });
                    }
                    MediaSessionEvent::IceCandidateGathered { call_id, candidate } => {
                        let _ = event_tx.send(SoftphoneEvent::IceCandidateReady {
                            call_id,
                            candidate,
                        });
                    }
                    MediaSessionEvent::IceCandidatesRemoved { .. }
                    | MediaSessionEvent::RemoteTrackAdded { .. } => {}
                }
            }
        });
    }

    /// Per-call teardown guard. Clones of the Arc stay valid after the map
    /// entry is dropped in finalize_call, so late waiters still serialize
    /// against the winner and then observe the terminal state.
    fn teardown_lock(&self, call_id: &str) -> Arc<AsyncMutex<()>> {
        self.teardown_locks
            .entry(call_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn engine(&self, call_id: &str) -> Result<Arc<MediaSessionEngine>> {
        self.sessions
            .get(call_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::CallNotFound(call_id.to_string()))
    }

    async fn set_state(
        &self,
        call_id: &str,
        state: CallState,
        reason: CallErrorReason,
        sip_code: Option<u16>,
        sip_reason: Option<&str>,
    ) -> Result<()> {
        self.state_machine
            .transition(call_id, state, reason, sip_code, sip_reason)
            .await?;
        let _ = self.event_tx.send(SoftphoneEvent::CallStateChanged {
            call_id: call_id.to_string(),
            state,
            reason,
        });
        Ok(())
    }

    /// Mark a call failed: end time, Error transition, aborted call log,
    /// media teardown, error event. Persistence failures along the way are
    /// logged and never abort the teardown.
    async fn fail_call(&self, call_id: &str, reason: CallErrorReason, detail: &str) {
        let lock = self.teardown_lock(call_id);
        let _guard = lock.lock().await;
        if let Ok(state) = self.state_machine.current_state(call_id).await {
            if state.is_terminal() {
                debug!(
                    "Failure report for already-ended call {} ignored: {}",
                    call_id, detail
                );
                return;
            }
        }
        error!("Call {} failed: {}", call_id, detail);

        if let Err(e) = self
            .repository
            .set_call_end_time(call_id, self.clock.now())
            .await
        {
            warn!("Failed to set end time for call {}: {}", call_id, e);
        }
        if let Err(e) = self
            .set_state(call_id, CallState::Error, reason, None, Some(detail))
            .await
        {
            warn!("Failed to record error state for call {}: {}", call_id, e);
        }
        self.finalize_call(call_id, CallOutcome::Aborted).await;

        let _ = self.event_tx.send(SoftphoneEvent::Error {
            call_id: Some(call_id.to_string()),
            message: detail.to_string(),
        });
    }

    /// Write the call log and tear down the media session.
    async fn finalize_call(&self, call_id: &str, outcome: CallOutcome) {
        match self.repository.get_session(call_id).await {
            Ok(Some(session)) => {
                if let Err(e) = self.repository.create_call_log(&session, outcome).await {
                    warn!("Failed to write call log for {}: {}", call_id, e);
                }
            }
            Ok(None) => debug!("No session record to log for call {}", call_id),
            Err(e) => warn!("Failed to load session for call {}: {}", call_id, e),
        }

        self.pending_offers.remove(call_id);
        if let Some((_, engine)) = self.sessions.remove(call_id) {
            engine.dispose().await;
        }
        self.teardown_locks.remove(call_id);
    }
}

/// Random alphanumeric token for SIP from-tags and Via branches.
fn generate_tag(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
