//! Protocol-level building blocks for the Redfire Softphone core

pub mod sdp;
pub mod ice;
pub mod dtmf;

pub use sdp::{sanitize, SdpError};
pub use ice::{IceCandidate, IceCandidateStore};
pub use dtmf::{DtmfSender, DtmfTiming};
