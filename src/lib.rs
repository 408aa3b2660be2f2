//! Redfire Softphone - embeddable SIP softphone core
//!
//! A platform-independent call/media negotiation core for SIP softphones:
//! SDP offer/answer handling, ICE candidate bookkeeping, media session
//! lifecycle, call state tracking and call history persistence.
//!
//! Platform concerns (audio I/O, the actual WebRTC stack, the storage engine
//! and the SIP signaling transport) are supplied by embedders through the
//! adapter traits in [`interfaces`].
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod config;
pub mod core;
pub mod protocols;
pub mod interfaces;
pub mod services;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

pub use crate::core::softphone::{SignalingEvent, SoftphoneCore, SoftphoneEvent};
pub use protocols::sdp::{sanitize, SdpError};
pub use services::call_state::{CallDirection, CallState, CallStateMachine};
pub use services::media_session::{MediaError, MediaSessionEngine};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
