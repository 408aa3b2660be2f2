//! Persistence adapter interface and in-memory reference store
//!
//! [`PersistenceAdapter`] is the storage seam consumed by
//! [`CallSessionRepository`](crate::services::repository::CallSessionRepository).
//! Any embedded key-value or relational store can implement it; [`MemoryStore`]
//! is the bundled reference implementation, used by embedders that do not need
//! durability and by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::services::accounts::AccountRecord;
use crate::services::call_state::{CallSession, CallStateTransition};
use crate::services::repository::{CallLogEntry, ContactStatistics, GeneralStatistics};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Per-account counters addressable for atomic increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticField {
    TotalCalls,
    SuccessfulCalls,
    FailedCalls,
    MissedCalls,
    TotalDurationSeconds,
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    // Accounts
    async fn get_account(&self, key: &str) -> StoreResult<Option<AccountRecord>>;
    async fn put_account(&self, account: AccountRecord) -> StoreResult<()>;

    // Call sessions
    async fn get_session(&self, call_id: &str) -> StoreResult<Option<CallSession>>;
    async fn put_session(&self, session: CallSession) -> StoreResult<()>;

    // State history (append-only)
    async fn append_transition(&self, transition: CallStateTransition) -> StoreResult<()>;
    async fn transitions_for_call(&self, call_id: &str) -> StoreResult<Vec<CallStateTransition>>;

    // Call logs
    async fn insert_call_log(&self, entry: CallLogEntry) -> StoreResult<()>;
    async fn call_logs(&self) -> StoreResult<Vec<CallLogEntry>>;

    // Statistics; increments must be atomic per account key
    async fn add_to_statistic(
        &self,
        account_key: &str,
        field: StatisticField,
        delta: i64,
    ) -> StoreResult<()>;
    async fn get_statistics(&self, account_key: &str) -> StoreResult<GeneralStatistics>;
    async fn add_contact_call(
        &self,
        account_key: &str,
        contact: &str,
        duration_seconds: i64,
    ) -> StoreResult<()>;
    async fn get_contact_statistics(
        &self,
        account_key: &str,
        contact: &str,
    ) -> StoreResult<Option<ContactStatistics>>;

    // Retention
    async fn delete_call_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
    async fn delete_transitions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
    async fn delete_inactive_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
    async fn trim_call_logs(&self, keep: usize) -> StoreResult<usize>;
    async fn trim_transitions(&self, keep: usize) -> StoreResult<usize>;
    async fn trim_sessions(&self, keep: usize) -> StoreResult<usize>;
}

/// In-memory reference adapter.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<String, AccountRecord>,
    sessions: DashMap<String, CallSession>,
    transitions: RwLock<Vec<CallStateTransition>>,
    call_logs: RwLock<Vec<CallLogEntry>>,
    statistics: DashMap<String, GeneralStatistics>,
    contact_statistics: DashMap<String, ContactStatistics>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn contact_key(account_key: &str, contact: &str) -> String {
        format!("{}|{}", account_key, contact)
    }

    fn session_age(session: &CallSession) -> DateTime<Utc> {
        session.end_time.unwrap_or(session.created_at)
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn get_account(&self, key: &str) -> StoreResult<Option<AccountRecord>> {
        Ok(self.accounts.get(key).map(|entry| entry.value().clone()))
    }

    async fn put_account(&self, account: AccountRecord) -> StoreResult<()> {
        self.accounts.insert(account.key(), account);
        Ok(())
    }

    async fn get_session(&self, call_id: &str) -> StoreResult<Option<CallSession>> {
        Ok(self.sessions.get(call_id).map(|entry| entry.value().clone()))
    }

    async fn put_session(&self, session: CallSession) -> StoreResult<()> {
        self.sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    async fn append_transition(&self, transition: CallStateTransition) -> StoreResult<()> {
        self.transitions.write().await.push(transition);
        Ok(())
    }

    async fn transitions_for_call(&self, call_id: &str) -> StoreResult<Vec<CallStateTransition>> {
        Ok(self
            .transitions
            .read()
            .await
            .iter()
            .filter(|t| t.call_id == call_id)
            .cloned()
            .collect())
    }

    async fn insert_call_log(&self, entry: CallLogEntry) -> StoreResult<()> {
        self.call_logs.write().await.push(entry);
        Ok(())
    }

    async fn call_logs(&self) -> StoreResult<Vec<CallLogEntry>> {
        Ok(self.call_logs.read().await.clone())
    }

    async fn add_to_statistic(
        &self,
        account_key: &str,
        field: StatisticField,
        delta: i64,
    ) -> StoreResult<()> {
        let mut stats = self
            .statistics
            .entry(account_key.to_string())
            .or_insert_with(|| GeneralStatistics::new(account_key));
        match field {
            StatisticField::TotalCalls => stats.total_calls += delta,
            StatisticField::SuccessfulCalls => stats.successful_calls += delta,
            StatisticField::FailedCalls => stats.failed_calls += delta,
            StatisticField::MissedCalls => stats.missed_calls += delta,
            StatisticField::TotalDurationSeconds => stats.total_duration_seconds += delta,
        }
        Ok(())
    }

    async fn get_statistics(&self, account_key: &str) -> StoreResult<GeneralStatistics> {
        Ok(self
            .statistics
            .get(account_key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| GeneralStatistics::new(account_key)))
    }

    async fn add_contact_call(
        &self,
        account_key: &str,
        contact: &str,
        duration_seconds: i64,
    ) -> StoreResult<()> {
        let mut stats = self
            .contact_statistics
            .entry(Self::contact_key(account_key, contact))
            .or_insert_with(|| ContactStatistics::new(account_key, contact));
        stats.call_count += 1;
        stats.total_duration_seconds += duration_seconds;
        Ok(())
    }

    async fn get_contact_statistics(
        &self,
        account_key: &str,
        contact: &str,
    ) -> StoreResult<Option<ContactStatistics>> {
        Ok(self
            .contact_statistics
            .get(&Self::contact_key(account_key, contact))
            .map(|entry| entry.value().clone()))
    }

    async fn delete_call_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut logs = self.call_logs.write().await;
        let before = logs.len();
        logs.retain(|entry| entry.created_at >= cutoff);
        Ok(before - logs.len())
    }

    async fn delete_transitions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut transitions = self.transitions.write().await;
        let before = transitions.len();
        transitions.retain(|t| t.timestamp >= cutoff);
        Ok(before - transitions.len())
    }

    async fn delete_inactive_sessions_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().current_state.is_terminal()
                    && Self::session_age(entry.value()) < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for call_id in stale {
            self.sessions.remove(&call_id);
        }
        Ok(count)
    }

    async fn trim_call_logs(&self, keep: usize) -> StoreResult<usize> {
        let mut logs = self.call_logs.write().await;
        let excess = logs.len().saturating_sub(keep);
        logs.drain(0..excess);
        Ok(excess)
    }

    async fn trim_transitions(&self, keep: usize) -> StoreResult<usize> {
        let mut transitions = self.transitions.write().await;
        let excess = transitions.len().saturating_sub(keep);
        transitions.drain(0..excess);
        Ok(excess)
    }

    async fn trim_sessions(&self, keep: usize) -> StoreResult<usize> {
        // Only archived (terminal) sessions are eligible; active calls stay.
        let mut archived: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().current_state.is_terminal())
            .map(|entry| (entry.key().clone(), Self::session_age(entry.value())))
            .collect();

        if archived.len() <= keep {
            return Ok(0);
        }

        archived.sort_by_key(|(_, age)| *age);
        let excess = archived.len() - keep;
        for (call_id, _) in archived.into_iter().take(excess) {
            self.sessions.remove(&call_id);
        }
        Ok(excess)
    }
}
