use crate::types::TranscriptSource;
use std::time::{Duration, Instant};

/// Live caption built from transcription deltas.
///
/// Deltas from the same source are appended; a delta from the other source
/// replaces the text, and nothing arriving for `timeout` clears it.
#[derive(Debug, Clone)]
pub struct TranscriptState {
    source: Option<TranscriptSource>,
    text: String,
    last_update: Option<Instant>,
    timeout: Duration,
}

impl TranscriptState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            source: None,
            text: String::new(),
            last_update: None,
            timeout,
        }
    }

    pub fn push(&mut self, source: TranscriptSource, delta: &str, now: Instant) {
        if self.source == Some(source) && !self.is_expired(now) {
            self.text.push_str(delta);
        } else {
            self.source = Some(source);
            self.text = delta.to_string();
        }
        self.last_update = Some(now);
    }

    /// Clear the caption once the inactivity timeout has passed. Returns true if cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.source.is_some() && self.is_expired(now) {
            self.clear();
            return true;
        }
        false
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.last_update
            .map(|at| now.saturating_duration_since(at) >= self.timeout)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.source = None;
        self.text.clear();
        self.last_update = None;
    }

    pub fn source(&self) -> Option<TranscriptSource> {
        self.source
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
