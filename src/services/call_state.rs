//! Call data model and call state machine
//!
//! [`CallSession`] is the per-dialog record: parties, SIP correlation tags,
//! sequencing fields and the negotiated SDP pair. [`CallStateMachine`] is the
//! single writer of state transitions; every reported transition is recorded
//! append-only, including ones that look out of order. SIP signaling is
//! routinely delivered out of order, so the machine records what actually
//! happened and leaves interpretation to consumers of the history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interfaces::clock::Clock;
use crate::services::repository::CallSessionRepository;
use crate::Result;

/// Call direction from the local party's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    #[serde(rename = "incoming")]
    Incoming,
    #[serde(rename = "outgoing")]
    Outgoing,
}

/// Authoritative call states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "ringing")]
    Ringing,
    #[serde(rename = "negotiating")]
    Negotiating,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "holding")]
    Holding,
    #[serde(rename = "ended")]
    Ended,
    #[serde(rename = "error")]
    Error,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Error)
    }
}

/// Why a call (or a transition) went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallErrorReason {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "signaling_failure")]
    SignalingFailure,
    #[serde(rename = "media_failure")]
    MediaFailure,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "cancelled")]
    Cancelled,
}

/// One active or archived call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub account_key: String,
    pub direction: CallDirection,
    pub from: String,
    pub to: String,

    // SIP dialog correlation identifiers, immutable once set
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub invite_from_tag: Option<String>,
    pub invite_to_tag: Option<String>,

    // Retransmission/ordering safety
    pub last_cseq: u32,
    pub via_branch: Option<String>,

    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,

    pub current_state: CallState,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        account_key: String,
        direction: CallDirection,
        from: String,
        to: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            account_key,
            direction,
            from,
            to,
            from_tag: None,
            to_tag: None,
            invite_from_tag: None,
            invite_to_tag: None,
            last_cseq: 0,
            via_branch: None,
            local_sdp: None,
            remote_sdp: None,
            current_state: CallState::Idle,
            created_at,
            start_time: Some(created_at),
            end_time: None,
        }
    }

    /// Remote party URI/username, derived from direction.
    pub fn remote_party(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.to,
            CallDirection::Incoming => &self.from,
        }
    }

    /// Local party URI/username, derived from direction.
    pub fn local_party(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.from,
            CallDirection::Incoming => &self.to,
        }
    }

    /// Set a dialog tag if it has not been set yet. Tags are written once
    /// during INVITE processing and never change afterwards.
    pub fn set_from_tag(&mut self, tag: String) {
        if self.from_tag.is_none() {
            self.from_tag = Some(tag);
        }
    }

    pub fn set_to_tag(&mut self, tag: String) {
        if self.to_tag.is_none() {
            self.to_tag = Some(tag);
        }
    }

    pub fn set_invite_tags(&mut self, from_tag: Option<String>, to_tag: Option<String>) {
        if self.invite_from_tag.is_none() {
            self.invite_from_tag = from_tag;
        }
        if self.invite_to_tag.is_none() {
            self.invite_to_tag = to_tag;
        }
    }

    /// Track the highest CSeq seen on this dialog.
    pub fn record_cseq(&mut self, cseq: u32) {
        if cseq > self.last_cseq {
            self.last_cseq = cseq;
        }
    }
}

/// Immutable, append-only record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStateTransition {
    pub call_id: String,
    pub from_state: CallState,
    pub to_state: CallState,
    pub timestamp: DateTime<Utc>,
    pub error_reason: CallErrorReason,
    pub sip_code: Option<u16>,
    pub sip_reason: Option<String>,
    pub has_error: bool,
}

/// Records call state transitions through the repository.
pub struct CallStateMachine {
    repository: Arc<CallSessionRepository>,
    clock: Arc<dyn Clock>,
}

impl CallStateMachine {
    pub fn new(repository: Arc<CallSessionRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Record a transition for `call_id` and update the session's current
    /// state. Transitions are recorded unconditionally; a session with no
    /// recorded state is treated as implicitly Idle. Leaving a terminal state
    /// is logged but still recorded, so out-of-order signaling stays visible
    /// in the history.
    pub async fn transition(
        &self,
        call_id: &str,
        to_state: CallState,
        error_reason: CallErrorReason,
        sip_code: Option<u16>,
        sip_reason: Option<&str>,
    ) -> Result<CallStateTransition> {
        let record = self
            .repository
            .update_call_state(
                call_id,
                to_state,
                error_reason,
                sip_code,
                sip_reason,
                self.clock.now(),
            )
            .await?;

        if record.from_state.is_terminal() {
            warn!(
                "Call {} transitioned out of terminal state {:?} to {:?}",
                call_id, record.from_state, to_state
            );
        } else {
            debug!(
                "Call {} transitioned {:?} -> {:?}",
                call_id, record.from_state, to_state
            );
        }

        Ok(record)
    }

    /// Record the call end time on the session, then transition to Ended.
    pub async fn end_call(
        &self,
        call_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<CallStateTransition> {
        self.repository.set_call_end_time(call_id, end_time).await?;
        self.transition(call_id, CallState::Ended, CallErrorReason::None, None, None)
            .await
    }

    /// Current state for the call; implicit Idle when nothing is recorded.
    pub async fn current_state(&self, call_id: &str) -> Result<CallState> {
        self.repository.current_state(call_id).await
    }

    pub async fn history(&self, call_id: &str) -> Result<Vec<CallStateTransition>> {
        self.repository.transitions_for_call(call_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::clock::ManualClock;
    use crate::interfaces::persistence::MemoryStore;

    fn machine() -> (CallStateMachine, Arc<CallSessionRepository>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let repository = Arc::new(CallSessionRepository::new(
            store,
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let machine = CallStateMachine::new(
            Arc::clone(&repository),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (machine, repository, clock)
    }

    #[tokio::test]
    async fn test_two_transitions_yield_two_rows_and_final_state() {
        let (machine, _, clock) = machine();

        machine
            .transition("c1", CallState::Ringing, CallErrorReason::None, None, None)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        machine
            .transition("c1", CallState::Connected, CallErrorReason::None, None, None)
            .await
            .unwrap();

        let history = machine.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(machine.current_state("c1").await.unwrap(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_first_transition_starts_from_implicit_idle() {
        let (machine, _, _) = machine();

        let record = machine
            .transition("c1", CallState::Ringing, CallErrorReason::None, None, None)
            .await
            .unwrap();
        assert_eq!(record.from_state, CallState::Idle);
        assert_eq!(record.to_state, CallState::Ringing);
    }

    #[tokio::test]
    async fn test_illogical_transitions_are_still_recorded() {
        let (machine, _, clock) = machine();

        machine
            .transition("c1", CallState::Ended, CallErrorReason::None, None, None)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        // Out-of-order signaling: Ended -> Ringing is recorded, not rejected
        machine
            .transition("c1", CallState::Ringing, CallErrorReason::None, None, None)
            .await
            .unwrap();

        let history = machine.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from_state, CallState::Ended);
        assert_eq!(machine.current_state("c1").await.unwrap(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_timestamps_are_monotonic_per_call() {
        let (machine, _, clock) = machine();

        for state in [CallState::Ringing, CallState::Negotiating, CallState::Connected] {
            machine
                .transition("c1", state, CallErrorReason::None, None, None)
                .await
                .unwrap();
            clock.advance(chrono::Duration::milliseconds(10));
        }

        let history = machine.history("c1").await.unwrap();
        assert_eq!(history.len(), 3);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_error_flag_set_for_error_reason_or_error_state() {
        let (machine, _, _) = machine();

        let with_reason = machine
            .transition(
                "c1",
                CallState::Ended,
                CallErrorReason::Timeout,
                Some(408),
                Some("Request Timeout"),
            )
            .await
            .unwrap();
        assert!(with_reason.has_error);
        assert_eq!(with_reason.sip_code, Some(408));

        let error_state = machine
            .transition("c2", CallState::Error, CallErrorReason::None, None, None)
            .await
            .unwrap();
        assert!(error_state.has_error);

        let clean = machine
            .transition("c3", CallState::Ringing, CallErrorReason::None, None, None)
            .await
            .unwrap();
        assert!(!clean.has_error);
    }

    #[tokio::test]
    async fn test_end_call_records_end_time_then_ends() {
        let (machine, repository, clock) = machine();
        let now = clock.now();

        repository
            .create_session(CallSession::new(
                "c1".to_string(),
                "alice@example.com".to_string(),
                CallDirection::Outgoing,
                "alice".to_string(),
                "bob@example.com".to_string(),
                now,
            ))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(30));
        let end_time = clock.now();
        let record = machine.end_call("c1", end_time).await.unwrap();
        assert_eq!(record.to_state, CallState::Ended);

        let session = repository.get_session("c1").await.unwrap().unwrap();
        assert_eq!(session.end_time, Some(end_time));
        assert_eq!(session.current_state, CallState::Ended);
    }
}
