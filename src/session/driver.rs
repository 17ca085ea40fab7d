use super::state::{ConnectionState, LifecycleState, SessionStatus, TranscriptLine};
use crate::analyser::Analyser;
use crate::audio_capture::{AudioFrame, CaptureHandle};
use crate::audio_sink::{OutputGraph, SourceId};
use crate::error::VoiceError;
use crate::playback::PlaybackScheduler;
use crate::transcript::TranscriptState;
use crate::transport::{EncodedChunk, ServerEvent, TransportSession};
use crate::visualizer::{render_frame, ActivityState, EnergyReading, FrameSink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Everything one activation owns. Lives in the shared slot; whoever takes
/// it out of the slot tears it down.
pub(crate) struct ActiveSession {
    pub(crate) epoch: u64,
    pub(crate) capture: Box<dyn CaptureHandle>,
    pub(crate) graph: Box<dyn OutputGraph>,
    pub(crate) transport: Box<dyn TransportSession>,
    pub(crate) scheduler: PlaybackScheduler,
    pub(crate) transcript: TranscriptState,
    pub(crate) input_tap: Analyser,
    pub(crate) output_tap: Analyser,
    pub(crate) cancel: CancellationToken,
    pub(crate) driver: Option<JoinHandle<()>>,
}

impl ActiveSession {
    pub(crate) fn teardown(mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        self.scheduler.stop_all(self.graph.as_mut());
        self.capture.release();
        self.graph.close();
        self.transport.close();
        self.input_tap.reset();
        self.output_tap.reset();
        log::info!("Session: Session {} torn down", self.epoch);
    }
}

/// State shared by the controller and the driver task of the current session.
pub(crate) struct Shared {
    slot: Mutex<Option<ActiveSession>>,
    pub(crate) epoch: AtomicU64,
    pub(crate) muted: AtomicBool,
    pub(crate) status: watch::Sender<SessionStatus>,
    frame_sink: Mutex<Box<dyn FrameSink>>,
}

impl Shared {
    pub(crate) fn new(frame_sink: Box<dyn FrameSink>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            slot: Mutex::new(None),
            epoch: AtomicU64::new(0),
            muted: AtomicBool::new(false),
            status,
            frame_sink: Mutex::new(frame_sink),
        }
    }

    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    pub(crate) fn set_frame_sink(&self, sink: Box<dyn FrameSink>) {
        *self.frame_sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Run `f` against the session of `epoch`. None when it has been stopped
    /// or replaced.
    pub(crate) fn with_session<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut ActiveSession, &watch::Sender<SessionStatus>) -> R,
    ) -> Option<R> {
        let mut slot = self.lock_slot();
        match slot.as_mut() {
            Some(session) if session.epoch == epoch && self.is_current(epoch) => {
                Some(f(session, &self.status))
            }
            _ => None,
        }
    }

    pub(crate) fn take_session(&self, epoch: u64) -> Option<ActiveSession> {
        let mut slot = self.lock_slot();
        match slot.as_ref() {
            Some(session) if session.epoch == epoch => slot.take(),
            _ => None,
        }
    }

    /// Publish only if `epoch` is still the newest activation.
    pub(crate) fn publish_if_current(&self, epoch: u64, f: impl FnOnce(&mut SessionStatus)) {
        let _slot = self.lock_slot();
        if self.is_current(epoch) {
            self.status.send_modify(f);
        }
    }

    fn present(&self, reading: &EnergyReading) {
        let frame = render_frame(reading);
        if let Ok(mut sink) = self.frame_sink.lock() {
            sink.present(&frame);
        }
    }
}

/// Status fields cleared whenever a session ends
pub(crate) fn reset_session_fields(status: &mut SessionStatus) {
    status.connection = None;
    status.activity = ActivityState::Idle;
    status.transcript = None;
    status.input_level = 0.0;
    status.output_level = 0.0;
}

/// The single cooperative task that applies capture frames, server events,
/// playback completions and redraw ticks to one session.
pub(crate) struct Driver {
    pub(crate) shared: std::sync::Arc<Shared>,
    pub(crate) epoch: u64,
    pub(crate) mime_type: String,
    pub(crate) tick: Duration,
}

impl Driver {
    pub(crate) async fn run(
        self,
        mut frames: mpsc::Receiver<AudioFrame>,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut completions: mpsc::UnboundedReceiver<SourceId>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::debug!("Session: Driver {} running", self.epoch);

        loop {
            let keep_going = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                Some(event) = events.recv() => self.on_server_event(event),
                Some(id) = completions.recv() => self.on_source_ended(id),
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => {
                        self.finish(Some(VoiceError::DeviceUnavailable(
                            "microphone stream ended".to_string(),
                        )));
                        false
                    }
                },
                _ = ticker.tick() => self.on_tick(),
            };
            if !keep_going {
                break;
            }
        }
        log::debug!("Session: Driver {} stopped", self.epoch);
    }

    fn on_frame(&self, frame: AudioFrame) -> bool {
        let muted = self.shared.muted.load(Ordering::Acquire);
        self.shared
            .with_session(self.epoch, |session, _| {
                // The tap sees every frame; mute only gates the transport
                session.input_tap.write(&frame.samples);
                if !muted {
                    session
                        .transport
                        .send(EncodedChunk::from_frame(&frame, &self.mime_type));
                }
            })
            .is_some()
    }

    fn on_server_event(&self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Opened => self
                .shared
                .with_session(self.epoch, |_, status| {
                    log::info!("Session: Connected");
                    status.send_modify(|s| s.connection = Some(ConnectionState::Connected));
                })
                .is_some(),
            ServerEvent::AudioChunk { payload } => {
                let scheduled = self.shared.with_session(self.epoch, |session, _| {
                    session
                        .scheduler
                        .schedule_chunk(session.graph.as_mut(), &payload)
                });
                match scheduled {
                    None => false,
                    Some(Ok(_)) => true,
                    Some(Err(e)) if e.is_fatal() => {
                        self.finish(Some(e));
                        false
                    }
                    Some(Err(e)) => {
                        log::warn!("Playback: Skipping chunk of {} bytes: {}", payload.len(), e);
                        true
                    }
                }
            }
            ServerEvent::TranscriptDelta { source, text } => {
                let now = Instant::now().into_std();
                self.shared
                    .with_session(self.epoch, |session, status| {
                        session.transcript.push(source, &text, now);
                        let line = TranscriptLine {
                            source,
                            text: session.transcript.text().to_string(),
                        };
                        status.send_modify(|s| s.transcript = Some(line));
                    })
                    .is_some()
            }
            ServerEvent::Interrupted => self
                .shared
                .with_session(self.epoch, |session, _| {
                    log::info!(
                        "Session: Interrupted, flushing {} queued sources",
                        session.scheduler.active_count()
                    );
                    session.scheduler.stop_all(session.graph.as_mut());
                })
                .is_some(),
            ServerEvent::TurnComplete => {
                log::debug!("Session: Turn complete");
                true
            }
            ServerEvent::Closed => {
                log::info!("Session: Server closed the session");
                self.finish(None);
                false
            }
            ServerEvent::Error { detail } => {
                self.finish(Some(VoiceError::Transport(detail)));
                false
            }
        }
    }

    fn on_source_ended(&self, id: SourceId) -> bool {
        self.shared
            .with_session(self.epoch, |session, _| {
                session.scheduler.on_source_ended(id);
            })
            .is_some()
    }

    fn on_tick(&self) -> bool {
        let now = Instant::now().into_std();
        let reading = self.shared.with_session(self.epoch, |session, status| {
            let reading =
                EnergyReading::sample(Some(&session.input_tap), Some(&session.output_tap));
            let expired = session.transcript.expire(now);
            let activity = reading.activity();
            status.send_if_modified(|s| {
                let changed = s.activity != activity || expired;
                s.activity = activity;
                s.input_level = reading.input_mean;
                s.output_level = reading.output_mean;
                if expired {
                    s.transcript = None;
                }
                changed
            });
            reading
        });

        match reading {
            Some(reading) => {
                self.shared.present(&reading);
                true
            }
            None => false,
        }
    }

    /// End the session from inside the driver: remote close or a fatal error.
    fn finish(&self, error: Option<VoiceError>) {
        let Some(session) = self.shared.take_session(self.epoch) else {
            return;
        };
        session.teardown();

        self.shared.publish_if_current(self.epoch, |status| {
            reset_session_fields(status);
            match &error {
                None => {
                    status.lifecycle = LifecycleState::Inactive;
                    status.message = None;
                }
                Some(err) => {
                    log::error!("Session: {}", err);
                    status.lifecycle = LifecycleState::Error;
                    status.message = Some(err.status_message().to_string());
                    if matches!(err, VoiceError::Transport(_)) {
                        status.connection = Some(ConnectionState::Error);
                    }
                }
            }
        });
    }
}
