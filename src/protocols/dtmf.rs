//! DTMF (Dual-Tone Multi-Frequency) tone sequencing
//!
//! Sends one tone every `tone_duration + inter_tone_gap` through the media
//! engine adapter. Sending is best-effort per tone: a failure on one digit is
//! logged and the sequence continues. The whole sequence stops promptly when
//! the owning session's cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DtmfConfig;
use crate::interfaces::media_engine::{MediaEngineAdapter, PeerHandle};

#[derive(Debug, Clone, Copy)]
pub struct DtmfTiming {
    pub tone_duration: Duration,
    pub inter_tone_gap: Duration,
}

impl DtmfTiming {
    pub fn new(tone_duration_ms: u64, inter_tone_gap_ms: u64) -> Self {
        Self {
            tone_duration: Duration::from_millis(tone_duration_ms),
            inter_tone_gap: Duration::from_millis(inter_tone_gap_ms),
        }
    }
}

impl From<&DtmfConfig> for DtmfTiming {
    fn from(config: &DtmfConfig) -> Self {
        Self::new(config.tone_duration_ms, config.inter_tone_gap_ms)
    }
}

fn is_dtmf_tone(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D' | 'a'..='d')
}

/// Asynchronous DTMF sequence sender.
pub struct DtmfSender;

impl DtmfSender {
    /// Spawn a task that paces the tone sequence out through the adapter.
    /// Invalid characters in `tones` are skipped up front.
    pub fn spawn(
        call_id: String,
        tones: &str,
        timing: DtmfTiming,
        adapter: Arc<dyn MediaEngineAdapter>,
        peer: PeerHandle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let sequence: Vec<char> = tones
            .chars()
            .filter(|c| {
                let valid = is_dtmf_tone(*c);
                if !valid {
                    warn!("Skipping invalid DTMF character {:?} for call {}", c, call_id);
                }
                valid
            })
            .map(|c| c.to_ascii_uppercase())
            .collect();

        tokio::spawn(async move {
            let tone_ms = timing.tone_duration.as_millis() as u64;
            for tone in sequence {
                if cancel.is_cancelled() {
                    debug!("DTMF sequence for call {} cancelled", call_id);
                    return;
                }

                let send = adapter.send_dtmf_tone(peer, tone, tone_ms);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("DTMF sequence for call {} cancelled mid-tone", call_id);
                        return;
                    }
                    result = send => {
                        if let Err(e) = result {
                            // Best-effort: keep going with the rest of the sequence
                            warn!("Failed to send DTMF tone {} for call {}: {}", tone, call_id, e);
                        } else {
                            debug!("Sent DTMF tone {} for call {}", tone, call_id);
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("DTMF sequence for call {} cancelled in gap", call_id);
                        return;
                    }
                    _ = tokio::time::sleep(timing.tone_duration + timing.inter_tone_gap) => {}
                }
            }
        })
    }
}
