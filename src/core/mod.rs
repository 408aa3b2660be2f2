//! Core orchestration for the Redfire Softphone

pub mod softphone;

pub use self::softphone::{SignalingEvent, SoftphoneCore, SoftphoneEvent};
