//! SIP account registry
//!
//! Credential and registration-state bookkeeping, keyed `username@domain`.
//! Registration state transitions are caller-driven; the registry stores the
//! expiry for others to query and never schedules re-registration itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::interfaces::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RegistrationState {
    #[default]
    #[serde(rename = "unregistered")]
    Unregistered,
    #[serde(rename = "registering")]
    Registering,
    #[serde(rename = "registered")]
    Registered,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RegistrationError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("registration timed out")]
    Timeout,
    #[error("registrar rejected the request")]
    ServerRejected,
    #[error("account is not registered")]
    NotRegistered,
}

/// One SIP account identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub domain: String,
    pub password: Option<String>,
    pub display_name: Option<String>,
    pub registration_state: RegistrationState,
    pub registration_expiry: Option<DateTime<Utc>>,
    pub push_token: Option<String>,
}

impl AccountRecord {
    pub fn new<S: Into<String>>(username: S, domain: S) -> Self {
        Self {
            username: username.into(),
            domain: domain.into(),
            password: None,
            display_name: None,
            registration_state: RegistrationState::Unregistered,
            registration_expiry: None,
            push_token: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}@{}", self.username, self.domain)
    }

    /// SIP URI for the local party of calls placed on this account.
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }
}

/// Keyed store of SIP accounts.
pub struct AccountRegistry {
    accounts: DashMap<String, AccountRecord>,
    clock: Arc<dyn Clock>,
}

impl AccountRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: DashMap::new(),
            clock,
        }
    }

    pub fn upsert(&self, account: AccountRecord) {
        debug!("Upserting account {}", account.key());
        self.accounts.insert(account.key(), account);
    }

    pub fn get(&self, key: &str) -> Option<AccountRecord> {
        self.accounts.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<AccountRecord> {
        self.accounts.remove(key).map(|(_, account)| account)
    }

    pub fn all(&self) -> Vec<AccountRecord> {
        self.accounts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Caller-driven registration state change. `expires_in_secs` is only
    /// meaningful for the Registered state.
    pub fn set_registration_state(
        &self,
        key: &str,
        state: RegistrationState,
        expires_in_secs: Option<u32>,
    ) -> bool {
        match self.accounts.get_mut(key) {
            Some(mut entry) => {
                entry.registration_state = state;
                entry.registration_expiry = match (state, expires_in_secs) {
                    (RegistrationState::Registered, Some(secs)) => {
                        Some(self.clock.now() + chrono::Duration::seconds(secs as i64))
                    }
                    (RegistrationState::Registered, None) => entry.registration_expiry,
                    _ => None,
                };
                info!("Account {} registration state: {:?}", key, state);
                true
            }
            None => false,
        }
    }

    pub fn set_push_token(&self, key: &str, token: Option<String>) -> bool {
        match self.accounts.get_mut(key) {
            Some(mut entry) => {
                entry.push_token = token;
                true
            }
            None => false,
        }
    }

    /// Registered and not past expiry. The registry does not re-register;
    /// a scheduler watching `registration_expiry` is the embedder's job.
    pub fn is_registered(&self, key: &str) -> bool {
        match self.accounts.get(key) {
            Some(entry) => {
                entry.registration_state == RegistrationState::Registered
                    && entry
                        .registration_expiry
                        .map(|expiry| expiry > self.clock.now())
                        .unwrap_or(true)
            }
            None => false,
        }
    }

    /// Resolve the local-party identity for outgoing calls on this account.
    pub fn local_identity(&self, key: &str) -> Option<String> {
        self.get(key).map(|account| match &account.display_name {
            Some(name) => format!("\"{}\" <{}>", name, account.uri()),
            None => account.uri(),
        })
    }
}
