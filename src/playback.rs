//! Gapless scheduling of inbound audio chunks against the output clock.

use crate::audio_sink::{OutputGraph, SourceId};
use crate::error::Result;
use crate::pcm;
use std::collections::HashSet;
use std::sync::Arc;

/// Where and for how long a chunk was placed on the output clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

/// Places each decoded chunk at `max(now, cursor)` and advances the cursor
/// past it, so back-to-back chunks play without gaps and late chunks never
/// overlap what is already queued.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    cursor: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a PCM payload and schedule it. Empty and odd-length payloads
    /// are rejected before anything reaches the graph.
    pub fn schedule_chunk(
        &mut self,
        graph: &mut dyn OutputGraph,
        payload: &[u8],
    ) -> Result<ScheduledSource> {
        let samples = pcm::decode_strict(payload)?;
        self.schedule_samples(graph, samples)
    }

    pub fn schedule_samples(
        &mut self,
        graph: &mut dyn OutputGraph,
        samples: Vec<f32>,
    ) -> Result<ScheduledSource> {
        let duration = samples.len() as f64 / graph.sample_rate() as f64;
        let start = graph.current_time().max(self.cursor);
        let id = self.next_id;

        graph.start_source(id, Arc::from(samples), start)?;

        self.next_id += 1;
        self.active.insert(id);
        self.cursor = start + duration;

        log::debug!(
            "Playback: source {} at {:.3}s for {:.3}s ({} active)",
            id,
            start,
            duration,
            self.active.len()
        );

        Ok(ScheduledSource {
            id,
            start,
            duration,
        })
    }

    /// A source finished on its own. Returns false for ids no longer tracked.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id)
    }

    /// Silence everything queued and rewind the cursor.
    pub fn stop_all(&mut self, graph: &mut dyn OutputGraph) {
        if !self.active.is_empty() {
            log::debug!("Playback: stopping {} active sources", self.active.len());
        }
        for id in self.active.drain() {
            graph.stop_source(id);
        }
        self.cursor = 0.0;
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }
}
