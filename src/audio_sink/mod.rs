//! Output side of the session: an audio graph that plays buffers at absolute
//! times on its own clock and reports when each one ends.

pub mod imp_cpal;

use crate::analyser::Analyser;
use crate::config::VoiceConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use imp_cpal::CpalOutput;

/// Identifies one scheduled buffer within an output graph
pub type SourceId = u64;

/// Opens output graphs. One graph is opened per session activation.
#[async_trait::async_trait]
pub trait OutputDevice: Send + Sync {
    /// Open a graph running at `config.playback_sample_rate`.
    ///
    /// Everything the graph plays is also written into `tap`. The id of every
    /// source that finishes on its own is sent on `completions`; sources
    /// stopped through [`OutputGraph::stop_source`] are not reported.
    async fn open(
        &self,
        config: &VoiceConfig,
        tap: Analyser,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputGraph>>;
}

/// A live output graph.
pub trait OutputGraph: Send {
    /// Seconds on the graph's output clock. Non-decreasing.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Play `samples` (mono, at [`OutputGraph::sample_rate`]) starting at `at` seconds.
    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> Result<()>;

    /// Silence a source immediately. Unknown ids are ignored.
    fn stop_source(&mut self, id: SourceId);

    /// Stop everything and release the device. Idempotent.
    ///
    /// Blocks while the backend drops its stream; the stream thread is
    /// woken immediately, so this is bounded by the backend teardown.
    fn close(&mut self);
}
