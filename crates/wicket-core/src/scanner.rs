//! QR acquisition: per-frame decoding with deduplication, plus debounced
//! manual entry.

use crate::decoder::QrDecoder;
use crate::types::DecodedCode;
use std::sync::Arc;
use wicket_hw::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Turns camera frames into at most one `Detected` code per scan.
pub struct QrScanner {
    decoder: Arc<dyn QrDecoder>,
    state: ScanState,
    /// Last value accepted into the flow; identical reads are ignored.
    last_accepted: Option<String>,
}

impl QrScanner {
    pub fn new(decoder: Arc<dyn QrDecoder>) -> Self {
        Self {
            decoder,
            state: ScanState::Idle,
            last_accepted: None,
        }
    }

    pub fn start(&mut self) {
        self.state = ScanState::Scanning;
    }

    pub fn stop(&mut self) {
        self.state = ScanState::Idle;
    }

    #[cfg(test)]
    fn state(&self) -> ScanState {
        self.state
    }

    pub fn last_accepted(&self) -> Option<&str> {
        self.last_accepted.as_deref()
    }

    /// Record a value accepted through another path (manual entry).
    pub fn remember(&mut self, value: &str) {
        self.last_accepted = Some(value.to_string());
    }

    pub fn clear_cache(&mut self) {
        self.last_accepted = None;
    }

    /// Decode one frame. Returns a code only for a new value, after which the
    /// scanner goes idle.
    ///
    /// Unready frames and decode failures are expected at video rate; they
    /// are logged and swallowed.
    pub fn scan(&mut self, frame: &Frame) -> Option<DecodedCode> {
        if self.state != ScanState::Scanning || !frame.is_decodable() {
            return None;
        }

        let value = match self.decoder.decode(&frame.data, frame.width, frame.height) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                tracing::debug!(seq = frame.sequence, error = %err, "QR decode miss");
                return None;
            }
        };

        if self.last_accepted.as_deref() == Some(value.as_str()) {
            tracing::trace!(code = %value, "duplicate QR read ignored");
            return None;
        }

        tracing::info!(code = %value, seq = frame.sequence, "QR code detected");
        self.last_accepted = Some(value.clone());
        self.state = ScanState::Idle;
        Some(DecodedCode::new(value))
    }
}

/// Debounce state for typed badge codes.
#[derive(Debug, Default)]
pub struct ManualEntry {
    pending: Option<String>,
}

impl ManualEntry {
    /// Register an edit. Returns the trimmed value to settle after the
    /// debounce window, or `None` if the edit should be ignored.
    pub fn input(&mut self, raw: &str, last_accepted: Option<&str>) -> Option<String> {
        let value = raw.trim();
        if value.is_empty() || Some(value) == last_accepted {
            return None;
        }
        self.pending = Some(value.to_string());
        Some(value.to_string())
    }

    /// True (and consumes the pending value) if `value` is still the latest
    /// edit once its debounce window has elapsed.
    pub fn settle(&mut self, value: &str) -> bool {
        if self.pending.as_deref() == Some(value) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}
