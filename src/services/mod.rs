//! Services module for the Redfire Softphone core

pub mod accounts;
pub mod call_state;
pub mod media_session;
pub mod repository;

pub use accounts::{AccountRecord, AccountRegistry, RegistrationError, RegistrationState};
pub use call_state::{
    CallDirection, CallErrorReason, CallSession, CallState, CallStateMachine, CallStateTransition,
};
pub use media_session::{
    MediaConnectionState, MediaError, MediaSessionEngine, MediaSessionEvent,
};
pub use repository::{
    CallLogEntry, CallOutcome, CallSessionRepository, CleanupReport, ContactStatistics,
    GeneralStatistics, RetentionLimits,
};
