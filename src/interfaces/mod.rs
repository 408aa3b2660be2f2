//! Platform adapter interfaces for the Redfire Softphone core
//!
//! Embedders supply the actual WebRTC stack, storage engine and clock through
//! these traits; the core never touches platform APIs directly.

pub mod clock;
pub mod media_engine;
pub mod persistence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use media_engine::{
    MediaConstraints, MediaEngineAdapter, MediaEngineError, MediaEngineEvent, PeerConnectionConfig,
    PeerConnectionState, PeerHandle, SdpKind, TrackHandle,
};
pub use persistence::{MemoryStore, PersistenceAdapter, StatisticField, StorageError};
