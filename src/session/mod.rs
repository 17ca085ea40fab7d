//! Session lifecycle: start, stop, mute and teardown of one realtime voice
//! session at a time.
//!
//! All per-session state lives in a single slot shared by the controller and
//! the session's driver task. Every activation gets a new epoch; anything
//! that completes for an older epoch (a slow connect, a late server event)
//! finds the epoch moved on and is dropped before it touches the slot.

mod driver;
pub mod state;

use crate::analyser::Analyser;
use crate::audio_capture::{CaptureDevice, CaptureHandle};
use crate::audio_sink::{OutputDevice, OutputGraph};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::playback::PlaybackScheduler;
use crate::transcript::TranscriptState;
use crate::transport::{Connector, SessionSetup, TransportSession};
use crate::types::InteractionMode;
use crate::visualizer::{FrameSink, LogFrameSink};
use driver::{reset_session_fields, ActiveSession, Driver, Shared};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use state::{ConnectionState, LifecycleState, SessionStatus, TranscriptLine};

/// Playback position of the running session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSnapshot {
    pub cursor: f64,
    pub active_sources: usize,
}

/// Resources opened so far by a start that has not finished yet
#[derive(Default)]
struct Acquired {
    capture: Option<Box<dyn CaptureHandle>>,
    graph: Option<Box<dyn OutputGraph>>,
    transport: Option<Box<dyn TransportSession>>,
}

impl Acquired {
    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }
        if let Some(mut graph) = self.graph.take() {
            graph.close();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

pub struct SessionController {
    config: VoiceConfig,
    capture: Arc<dyn CaptureDevice>,
    output: Arc<dyn OutputDevice>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        config: VoiceConfig,
        capture: Arc<dyn CaptureDevice>,
        output: Arc<dyn OutputDevice>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            capture,
            output,
            connector,
            shared: Arc::new(Shared::new(Box::new(LogFrameSink::default()))),
        }
    }

    /// Where rendered visualizer frames go. Defaults to a log sink.
    pub fn with_frame_sink(self, sink: Box<dyn FrameSink>) -> Self {
        self.shared.set_frame_sink(sink);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Mute gates what is sent, not what is captured. It is kept across
    /// stop, error and restart until changed here.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
        log::info!("Session: Microphone {}", if muted { "muted" } else { "unmuted" });
        self.shared.status.send_modify(|s| s.muted = muted);
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    pub fn playback(&self) -> Option<PlaybackSnapshot> {
        self.shared.lock_slot().as_ref().map(|session| PlaybackSnapshot {
            cursor: session.scheduler.cursor(),
            active_sources: session.scheduler.active_count(),
        })
    }

    /// Start a session in `mode`. A running session is torn down first, so
    /// there is never more than one open connection.
    ///
    /// Returns [`VoiceError::Cancelled`] when a `stop` or a newer `start`
    /// overtook this one while it was connecting.
    pub async fn start(&self, mode: InteractionMode) -> Result<()> {
        let previous = self.shared.lock_slot().take();
        if let Some(previous) = previous {
            log::info!("Session: Replacing running session");
            previous.teardown();
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let muted = self.is_muted();
        self.shared.status.send_modify(|s| {
            reset_session_fields(s);
            s.lifecycle = LifecycleState::Starting;
            s.connection = Some(ConnectionState::Connecting);
            s.mode = Some(mode);
            s.message = None;
            s.muted = muted;
        });
        log::info!("Session: Starting session {} ({} mode)", epoch, mode);

        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_queue);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let input_tap = Analyser::input();
        let output_tap = Analyser::output();

        let mut acquired = Acquired::default();
        let opened = async {
            acquired.capture = Some(self.capture.open(&self.config, frames_tx).await?);
            self.ensure_current(epoch)?;
            acquired.graph = Some(
                self.output
                    .open(&self.config, output_tap.clone(), completions_tx)
                    .await?,
            );
            self.ensure_current(epoch)?;
            let setup = SessionSetup::new(&self.config, mode);
            acquired.transport = Some(self.connector.connect(&setup, events_tx).await?);
            self.ensure_current(epoch)
        }
        .await;

        if let Err(e) = opened {
            acquired.release();
            return Err(self.fail(epoch, e));
        }

        let (Some(capture), Some(graph), Some(transport)) = (
            acquired.capture.take(),
            acquired.graph.take(),
            acquired.transport.take(),
        ) else {
            acquired.release();
            return Err(self.fail(epoch, VoiceError::Cancelled));
        };

        let mut slot = self.shared.lock_slot();
        if !self.shared.is_current(epoch) {
            drop(slot);
            let mut superseded = Acquired {
                capture: Some(capture),
                graph: Some(graph),
                transport: Some(transport),
            };
            superseded.release();
            return Err(self.fail(epoch, VoiceError::Cancelled));
        }

        let cancel = CancellationToken::new();
        let driver = Driver {
            shared: self.shared.clone(),
            epoch,
            mime_type: self.config.capture_mime_type(),
            tick: self.config.tick_interval,
        };
        let handle = tokio::spawn(driver.run(frames_rx, events_rx, completions_rx, cancel.clone()));

        *slot = Some(ActiveSession {
            epoch,
            capture,
            graph,
            transport,
            scheduler: PlaybackScheduler::new(),
            transcript: TranscriptState::new(self.config.transcript_timeout),
            input_tap,
            output_tap,
            cancel,
            driver: Some(handle),
        });
        // Published under the slot lock so the driver cannot end the session first
        self.shared
            .status
            .send_modify(|s| s.lifecycle = LifecycleState::Active);
        drop(slot);

        log::info!("Session: Session {} active", epoch);
        Ok(())
    }

    /// Stop the running session, if any. Synchronous and idempotent: on
    /// return the microphone is released and the output graph and connection
    /// are closed. Mute is left as it is.
    pub fn stop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let session = self.shared.lock_slot().take();
        if let Some(session) = session {
            log::info!("Session: Stopping session {}", session.epoch);
            session.teardown();
        }
        self.shared.status.send_modify(|s| {
            reset_session_fields(s);
            s.lifecycle = LifecycleState::Inactive;
            s.message = None;
        });
    }

    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.shared.is_current(epoch) {
            Ok(())
        } else {
            Err(VoiceError::Cancelled)
        }
    }

    /// Publish a failed start, unless a newer start or a stop already moved on.
    fn fail(&self, epoch: u64, err: VoiceError) -> VoiceError {
        if err == VoiceError::Cancelled {
            log::debug!("Session: Start {} superseded", epoch);
            return err;
        }
        log::error!("Session: Failed to start: {}", err);
        self.shared.publish_if_current(epoch, |status| {
            reset_session_fields(status);
            status.lifecycle = LifecycleState::Error;
            status.message = Some(err.status_message().to_string());
            if matches!(err, VoiceError::Transport(_)) {
                status.connection = Some(ConnectionState::Error);
            }
        });
        err
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let session = self.shared.lock_slot().take();
        if let Some(session) = session {
            session.teardown();
        }
    }
}
