//! Scripted stand-ins for the microphone, the output graph and the voice
//! service, so the session controller can be driven without hardware or
//! network.

#![allow(dead_code)]

use council_voice::analyser::Analyser;
use council_voice::audio_capture::{AudioFrame, CaptureDevice, CaptureHandle};
use council_voice::audio_sink::{OutputDevice, OutputGraph, SourceId};
use council_voice::config::VoiceConfig;
use council_voice::error::{Result, VoiceError};
use council_voice::session::SessionController;
use council_voice::transport::{
    Connector, EncodedChunk, EventSender, ServerEvent, SessionSetup, TransportSession,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TEST_FRAME_SIZE: usize = 256;

pub fn test_config() -> VoiceConfig {
    VoiceConfig {
        frame_size: TEST_FRAME_SIZE,
        tick_interval: Duration::from_millis(10),
        ..VoiceConfig::default()
    }
}

/// Give the driver task time to drain its queues and run a few ticks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

/// Deterministic broadband signal loud enough to register as speech
pub fn noise(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as f32 / u32::MAX as f32 - 0.5
        })
        .collect()
}

/// PCM payload of `samples` quiet samples
pub fn pcm_chunk(samples: usize) -> Vec<u8> {
    council_voice::pcm::encode(&vec![0.1; samples])
}

// ---------------------------------------------------------------------------
// Capture

#[derive(Default)]
struct CaptureState {
    opens: usize,
    generation: usize,
    sender: Option<mpsc::Sender<AudioFrame>>,
    released: Vec<Arc<AtomicBool>>,
    fail_next: Option<VoiceError>,
    seq: u64,
}

#[derive(Clone, Default)]
pub struct MockCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl MockCapture {
    pub fn fail_next(&self, err: VoiceError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// True when every handle ever opened has been released
    pub fn all_released(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .released
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }

    /// Push one frame into the live stream. False when no stream is open.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let mut state = self.state.lock().unwrap();
        let seq = state.seq;
        state.seq += 1;
        match &state.sender {
            Some(sender) => sender.try_send(AudioFrame { samples, seq }).is_ok(),
            None => false,
        }
    }

    /// Simulate the device disappearing mid-session
    pub fn unplug(&self) {
        self.state.lock().unwrap().sender = None;
    }
}

#[async_trait::async_trait]
impl CaptureDevice for MockCapture {
    async fn open(
        &self,
        _config: &VoiceConfig,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureHandle>> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.opens += 1;
        state.generation += 1;
        state.sender = Some(frames);
        let released = Arc::new(AtomicBool::new(false));
        state.released.push(released.clone());
        Ok(Box::new(MockCaptureHandle {
            state: self.state.clone(),
            generation: state.generation,
            released,
        }))
    }
}

struct MockCaptureHandle {
    state: Arc<Mutex<CaptureState>>,
    generation: usize,
    released: Arc<AtomicBool>,
}

impl CaptureHandle for MockCaptureHandle {
    fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.generation == self.generation {
            state.sender = None;
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Output

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSource {
    pub id: SourceId,
    pub at: f64,
    pub len: usize,
}

#[derive(Default)]
struct OutputState {
    opens: usize,
    time: f64,
    started: Vec<StartedSource>,
    stopped: Vec<SourceId>,
    open_graphs: usize,
    fail_sources: bool,
    completions: Option<mpsc::UnboundedSender<SourceId>>,
}

/// Output device with a hand-driven clock
#[derive(Clone, Default)]
pub struct MockOutput {
    state: Arc<Mutex<OutputState>>,
}

impl MockOutput {
    pub fn set_time(&self, seconds: f64) {
        self.state.lock().unwrap().time = seconds;
    }

    pub fn started(&self) -> Vec<StartedSource> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.state.lock().unwrap().stopped.clone()
    }

    /// Every later `start_source` fails as if the device went away
    pub fn fail_sources(&self) {
        self.state.lock().unwrap().fail_sources = true;
    }

    pub fn open_graphs(&self) -> usize {
        self.state.lock().unwrap().open_graphs
    }

    /// Report a source as played to the end
    pub fn finish(&self, id: SourceId) {
        if let Some(completions) = &self.state.lock().unwrap().completions {
            let _ = completions.send(id);
        }
    }
}

#[async_trait::async_trait]
impl OutputDevice for MockOutput {
    async fn open(
        &self,
        config: &VoiceConfig,
        _tap: Analyser,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputGraph>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        state.open_graphs += 1;
        state.completions = Some(completions);
        Ok(Box::new(MockGraph {
            state: self.state.clone(),
            rate: config.playback_sample_rate,
            closed: false,
        }))
    }
}

struct MockGraph {
    state: Arc<Mutex<OutputState>>,
    rate: u32,
    closed: bool,
}

impl OutputGraph for MockGraph {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.closed || state.fail_sources {
            return Err(VoiceError::DeviceUnavailable("graph closed".to_string()));
        }
        state.started.push(StartedSource {
            id,
            at,
            len: samples.len(),
        });
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.state.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().open_graphs -= 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Default)]
struct ConnectorState {
    connects: usize,
    live: usize,
    max_live: usize,
    sent: Vec<EncodedChunk>,
    setups: Vec<SessionSetup>,
    senders: Vec<EventSender>,
    fail_next: Option<VoiceError>,
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn fail_next(&self, err: VoiceError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    /// Make every connect take `delay` before succeeding
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn sent(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.state.lock().unwrap().setups.clone()
    }

    /// Deliver `event` on the most recent connection
    pub fn emit(&self, event: ServerEvent) {
        let state = self.state.lock().unwrap();
        if let Some(sender) = state.senders.last() {
            let _ = sender.send(event);
        }
    }

    /// Event sender of the `index`th connection, kept to replay stale events
    pub fn sender(&self, index: usize) -> EventSender {
        self.state.lock().unwrap().senders[index].clone()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        events: EventSender,
    ) -> Result<Box<dyn TransportSession>> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.connects += 1;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.setups.push(setup.clone());
        state.senders.push(events);
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MockTransport {
    state: Arc<Mutex<ConnectorState>>,
    closed: bool,
}

impl TransportSession for MockTransport {
    fn send(&self, chunk: EncodedChunk) {
        if !self.closed {
            self.state.lock().unwrap().sent.push(chunk);
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().live -= 1;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: Arc<SessionController>,
    pub capture: MockCapture,
    pub output: MockOutput,
    pub connector: MockConnector,
}

impl Harness {
    pub fn new() -> Self {
        let capture = MockCapture::default();
        let output = MockOutput::default();
        let connector = MockConnector::default();
        let controller = SessionController::new(
            test_config(),
            Arc::new(capture.clone()),
            Arc::new(output.clone()),
            Arc::new(connector.clone()),
        );
        Self {
            controller: Arc::new(controller),
            capture,
            output,
            connector,
        }
    }

    /// Nothing held: no microphone, no graph, no connection
    pub fn all_released(&self) -> bool {
        self.capture.all_released() && self.output.open_graphs() == 0 && self.connector.live() == 0
    }
}
