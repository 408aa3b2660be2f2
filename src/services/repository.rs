//! Call session repository
//!
//! Persistence facade over the [`PersistenceAdapter`]: call records, state
//! history, call logs and per-account statistics. The repository is the single
//! writer of statistics; counter updates go through the adapter's atomic
//! per-key increments, so concurrent call teardowns for different calls never
//! corrupt each other's counters.
//!
//! Statistics failures are logged and swallowed: call-state correctness takes
//! priority over analytics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::interfaces::clock::Clock;
use crate::interfaces::persistence::{PersistenceAdapter, StatisticField, StorageError};
use crate::services::accounts::{AccountRecord, RegistrationState};
use crate::services::call_state::{
    CallDirection, CallErrorReason, CallSession, CallState, CallStateTransition,
};
use crate::{Error, Result};

/// How a finished call is categorized for history and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "missed")]
    Missed,
    #[serde(rename = "declined")]
    Declined,
    #[serde(rename = "aborted")]
    Aborted,
}

/// One row of call history, written at call termination and never mutated
/// afterwards except by retention cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub id: String,
    pub call_id: String,
    pub account_key: String,
    pub phone_number: String,
    pub local_address: String,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-account aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralStatistics {
    pub account_key: String,
    pub total_calls: i64,
    pub successful_calls: i64,
    pub failed_calls: i64,
    pub missed_calls: i64,
    pub total_duration_seconds: i64,
}

impl GeneralStatistics {
    pub fn new<S: Into<String>>(account_key: S) -> Self {
        Self {
            account_key: account_key.into(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            missed_calls: 0,
            total_duration_seconds: 0,
        }
    }
}

/// Per-contact aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactStatistics {
    pub account_key: String,
    pub contact: String,
    pub call_count: i64,
    pub total_duration_seconds: i64,
}

impl ContactStatistics {
    pub fn new<S: Into<String>>(account_key: S, contact: S) -> Self {
        Self {
            account_key: account_key.into(),
            contact: contact.into(),
            call_count: 0,
            total_duration_seconds: 0,
        }
    }
}

/// Patch-merge update for accounts: only populated fields overwrite.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub password: Option<String>,
    pub display_name: Option<String>,
    pub push_token: Option<String>,
    pub registration_state: Option<RegistrationState>,
    pub registration_expiry: Option<DateTime<Utc>>,
}

/// Row caps for [`CallSessionRepository::keep_only_recent_data`].
#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    pub max_call_logs: usize,
    pub max_state_transitions: usize,
    pub max_archived_sessions: usize,
}

impl From<&StorageConfig> for RetentionLimits {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_call_logs: config.max_call_logs,
            max_state_transitions: config.max_state_transitions,
            max_archived_sessions: config.max_archived_sessions,
        }
    }
}

/// What a retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub call_logs_deleted: usize,
    pub transitions_deleted: usize,
    pub sessions_deleted: usize,
}

pub struct CallSessionRepository {
    store: Arc<dyn PersistenceAdapter>,
    clock: Arc<dyn Clock>,
}

impl CallSessionRepository {
    pub fn new(store: Arc<dyn PersistenceAdapter>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn storage_err(e: StorageError) -> Error {
        Error::storage(e.to_string())
    }

    // ---- Accounts -------------------------------------------------------

    /// Create or patch an account. Only populated patch fields overwrite;
    /// everything else keeps its stored value.
    pub async fn upsert_account(
        &self,
        username: &str,
        domain: &str,
        patch: AccountPatch,
    ) -> Result<AccountRecord> {
        let key = format!("{}@{}", username, domain);
        let mut account = self
            .store
            .get_account(&key)
            .await
            .map_err(Self::storage_err)?
            .unwrap_or_else(|| AccountRecord::new(username, domain));

        if let Some(password) = patch.password {
            account.password = Some(password);
        }
        if let Some(display_name) = patch.display_name {
            account.display_name = Some(display_name);
        }
        if let Some(push_token) = patch.push_token {
            account.push_token = Some(push_token);
        }
        if let Some(state) = patch.registration_state {
            account.registration_state = state;
        }
        if let Some(expiry) = patch.registration_expiry {
            account.registration_expiry = Some(expiry);
        }

        self.store
            .put_account(account.clone())
            .await
            .map_err(Self::storage_err)?;
        Ok(account)
    }

    pub async fn get_account(&self, key: &str) -> Result<Option<AccountRecord>> {
        self.store.get_account(key).await.map_err(Self::storage_err)
    }

    pub async fn update_registration_state(
        &self,
        key: &str,
        state: RegistrationState,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(mut account) = self
            .store
            .get_account(key)
            .await
            .map_err(Self::storage_err)?
        else {
            return Err(Error::storage(format!("No such account: {}", key)));
        };

        account.registration_state = state;
        account.registration_expiry = expiry;
        self.store
            .put_account(account)
            .await
            .map_err(Self::storage_err)
    }

    // ---- Call sessions --------------------------------------------------

    pub async fn create_session(&self, session: CallSession) -> Result<()> {
        debug!("Creating call session {}", session.call_id);
        self.store
            .put_session(session)
            .await
            .map_err(Self::storage_err)
    }

    pub async fn get_session(&self, call_id: &str) -> Result<Option<CallSession>> {
        self.store
            .get_session(call_id)
            .await
            .map_err(Self::storage_err)
    }

    pub async fn update_session(&self, session: CallSession) -> Result<()> {
        self.store
            .put_session(session)
            .await
            .map_err(Self::storage_err)
    }

    pub async fn set_call_end_time(
        &self,
        call_id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        match self
            .store
            .get_session(call_id)
            .await
            .map_err(Self::storage_err)?
        {
            Some(mut session) => {
                session.end_time = Some(end_time);
                self.store
                    .put_session(session)
                    .await
                    .map_err(Self::storage_err)
            }
            None => {
                debug!("set_call_end_time: no session record for {}", call_id);
                Ok(())
            }
        }
    }

    // ---- State history --------------------------------------------------

    /// Read the prior state, append the transition record, and apply the new
    /// state to the session. Timestamps are clamped to stay monotonically
    /// non-decreasing per call even if the clock steps backwards.
    pub async fn update_call_state(
        &self,
        call_id: &str,
        to_state: CallState,
        error_reason: CallErrorReason,
        sip_code: Option<u16>,
        sip_reason: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<CallStateTransition> {
        let session = self
            .store
            .get_session(call_id)
            .await
            .map_err(Self::storage_err)?;
        let from_state = match &session {
            Some(session) => session.current_state,
            None => self.state_from_history(call_id).await?,
        };

        let timestamp = match self
            .store
            .transitions_for_call(call_id)
            .await
            .map_err(Self::storage_err)?
            .last()
        {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };

        let record = CallStateTransition {
            call_id: call_id.to_string(),
            from_state,
            to_state,
            timestamp,
            error_reason,
            sip_code,
            sip_reason: sip_reason.map(str::to_string),
            has_error: error_reason != CallErrorReason::None || to_state == CallState::Error,
        };

        self.store
            .append_transition(record.clone())
            .await
            .map_err(Self::storage_err)?;

        if let Some(mut session) = session {
            session.current_state = to_state;
            self.store
                .put_session(session)
                .await
                .map_err(Self::storage_err)?;
        }

        Ok(record)
    }

    pub async fn current_state(&self, call_id: &str) -> Result<CallState> {
        match self
            .store
            .get_session(call_id)
            .await
            .map_err(Self::storage_err)?
        {
            Some(session) => Ok(session.current_state),
            None => self.state_from_history(call_id).await,
        }
    }

    async fn state_from_history(&self, call_id: &str) -> Result<CallState> {
        Ok(self
            .store
            .transitions_for_call(call_id)
            .await
            .map_err(Self::storage_err)?
            .last()
            .map(|t| t.to_state)
            .unwrap_or(CallState::Idle))
    }

    pub async fn transitions_for_call(&self, call_id: &str) -> Result<Vec<CallStateTransition>> {
        self.store
            .transitions_for_call(call_id)
            .await
            .map_err(Self::storage_err)
    }

    // ---- Call logs & statistics ----------------------------------------

    /// Write the call-history row for a finished call and apply the
    /// outcome-keyed statistics side effects.
    pub async fn create_call_log(
        &self,
        session: &CallSession,
        outcome: CallOutcome,
    ) -> Result<CallLogEntry> {
        let account = self
            .store
            .get_account(&session.account_key)
            .await
            .map_err(Self::storage_err)?;
        let account_username = account
            .as_ref()
            .map(|a| a.username.clone())
            .unwrap_or_default();

        // Party derivation depends on direction: for outgoing calls the
        // remote side is `to` and the local side is `from`; incoming inverts.
        let (phone_number, local_address) = match session.direction {
            CallDirection::Outgoing => (
                non_empty_or(&session.to, || derived_remote(session)),
                non_empty_or(&session.from, || account_username.clone()),
            ),
            CallDirection::Incoming => (
                non_empty_or(&session.from, || derived_remote(session)),
                non_empty_or(&session.to, || account_username.clone()),
            ),
        };

        let duration_seconds = match (session.start_time, session.end_time) {
            (Some(start), Some(end)) => ((end - start).num_milliseconds() / 1000).max(0),
            _ => 0,
        };

        let entry = CallLogEntry {
            id: Uuid::new_v4().to_string(),
            call_id: session.call_id.clone(),
            account_key: session.account_key.clone(),
            phone_number,
            local_address,
            direction: session.direction,
            outcome,
            start_time: session.start_time,
            end_time: session.end_time,
            duration_seconds,
            created_at: self.clock.now(),
        };

        self.store
            .insert_call_log(entry.clone())
            .await
            .map_err(Self::storage_err)?;

        self.apply_outcome_statistics(&entry).await;

        info!(
            "Call log for {}: {:?} {:?}, {}s",
            entry.call_id, entry.direction, entry.outcome, entry.duration_seconds
        );
        Ok(entry)
    }

    async fn apply_outcome_statistics(&self, entry: &CallLogEntry) {
        let account_key = &entry.account_key;

        self.bump(account_key, StatisticField::TotalCalls, 1).await;

        match entry.outcome {
            CallOutcome::Success => {
                self.bump(account_key, StatisticField::SuccessfulCalls, 1).await;
                if entry.duration_seconds > 0 {
                    self.bump(
                        account_key,
                        StatisticField::TotalDurationSeconds,
                        entry.duration_seconds,
                    )
                    .await;
                    if let Err(e) = self
                        .store
                        .add_contact_call(account_key, &entry.phone_number, entry.duration_seconds)
                        .await
                    {
                        warn!("Failed to update contact statistics: {}", e);
                    }
                }
            }
            CallOutcome::Missed => {
                self.bump(account_key, StatisticField::FailedCalls, 1).await;
                self.bump(account_key, StatisticField::MissedCalls, 1).await;
            }
            CallOutcome::Declined | CallOutcome::Aborted => {
                self.bump(account_key, StatisticField::FailedCalls, 1).await;
            }
        }
    }

    /// Statistics are best-effort: a failed increment is logged, never
    /// propagated into the call teardown path.
    async fn bump(&self, account_key: &str, field: StatisticField, delta: i64) {
        if let Err(e) = self.store.add_to_statistic(account_key, field, delta).await {
            warn!("Failed to update {:?} for {}: {}", field, account_key, e);
        }
    }

    pub async fn increment_total_calls(&self, account_key: &str) {
        self.bump(account_key, StatisticField::TotalCalls, 1).await;
    }

    pub async fn increment_successful_calls(&self, account_key: &str) {
        self.bump(account_key, StatisticField::SuccessfulCalls, 1).await;
    }

    pub async fn increment_failed_calls(&self, account_key: &str) {
        self.bump(account_key, StatisticField::FailedCalls, 1).await;
    }

    pub async fn increment_missed_calls(&self, account_key: &str) {
        self.bump(account_key, StatisticField::MissedCalls, 1).await;
    }

    pub async fn statistics(&self, account_key: &str) -> Result<GeneralStatistics> {
        self.store
            .get_statistics(account_key)
            .await
            .map_err(Self::storage_err)
    }

    pub async fn contact_statistics(
        &self,
        account_key: &str,
        contact: &str,
    ) -> Result<Option<ContactStatistics>> {
        self.store
            .get_contact_statistics(account_key, contact)
            .await
            .map_err(Self::storage_err)
    }

    pub async fn call_logs(&self) -> Result<Vec<CallLogEntry>> {
        self.store.call_logs().await.map_err(Self::storage_err)
    }

    // ---- Retention ------------------------------------------------------

    /// Delete call logs, state history and inactive call records older than
    /// `days_to_keep` days.
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<CleanupReport> {
        let cutoff = self.clock.now() - chrono::Duration::days(days_to_keep as i64);

        let report = CleanupReport {
            call_logs_deleted: self
                .store
                .delete_call_logs_before(cutoff)
                .await
                .map_err(Self::storage_err)?,
            transitions_deleted: self
                .store
                .delete_transitions_before(cutoff)
                .await
                .map_err(Self::storage_err)?,
            sessions_deleted: self
                .store
                .delete_inactive_sessions_before(cutoff)
                .await
                .map_err(Self::storage_err)?,
        };

        info!(
            "Retention cleanup (>{} days): {} logs, {} transitions, {} sessions",
            days_to_keep,
            report.call_logs_deleted,
            report.transitions_deleted,
            report.sessions_deleted
        );
        Ok(report)
    }

    /// Cap each table to its N most recent rows.
    pub async fn keep_only_recent_data(&self, limits: &RetentionLimits) -> Result<CleanupReport> {
        let report = CleanupReport {
            call_logs_deleted: self
                .store
                .trim_call_logs(limits.max_call_logs)
                .await
                .map_err(Self::storage_err)?,
            transitions_deleted: self
                .store
                .trim_transitions(limits.max_state_transitions)
                .await
                .map_err(Self::storage_err)?,
            sessions_deleted: self
                .store
                .trim_sessions(limits.max_archived_sessions)
                .await
                .map_err(Self::storage_err)?,
        };

        info!(
            "Retention trim: {} logs, {} transitions, {} sessions",
            report.call_logs_deleted, report.transitions_deleted, report.sessions_deleted
        );
        Ok(report)
    }
}

fn non_empty_or(value: &str, fallback: impl FnOnce() -> String) -> String {
    if value.is_empty() {
        fallback()
    } else {
        value.to_string()
    }
}

/// Last-resort remote-party string for sessions with blank URI fields.
fn derived_remote(session: &CallSession) -> String {
    let remote = session.remote_party();
    if remote.is_empty() {
        format!("unknown-{}", session.call_id)
    } else {
        remote.to_string()
    }
}
