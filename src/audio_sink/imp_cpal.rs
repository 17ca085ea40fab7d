use super::{OutputDevice, OutputGraph, SourceId};
use crate::analyser::Analyser;
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot};

struct PlayingSource {
    id: SourceId,
    samples: Arc<[f32]>,
    start_frame: u64,
    /// Length in device frames
    length: u64,
}

/// Sums every scheduled source into the device buffer. Owned by the output
/// callback; the graph handle only inserts and removes sources.
struct Mixer {
    frames_played: u64,
    device_rate: u32,
    source_rate: u32,
    sources: Vec<PlayingSource>,
    completions: mpsc::UnboundedSender<SourceId>,
    tap: Analyser,
    mix: Vec<f32>,
}

impl Mixer {
    fn new(
        device_rate: u32,
        source_rate: u32,
        tap: Analyser,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Self {
        Self {
            frames_played: 0,
            device_rate,
            source_rate,
            sources: Vec::new(),
            completions,
            tap,
            mix: Vec::new(),
        }
    }

    fn current_time(&self) -> f64 {
        self.frames_played as f64 / self.device_rate as f64
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.device_rate as f64).round() as u64
    }

    fn insert(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) {
        let duration = samples.len() as f64 / self.source_rate as f64;
        // Both ends round the same way, so a source placed at the previous
        // one's end time starts on exactly the frame that one stops
        let requested = self.frame_at(at);
        let length = self.frame_at(at + duration).saturating_sub(requested);
        // A start time that slipped into the past shifts rather than truncates
        let start_frame = requested.max(self.frames_played);
        self.sources.push(PlayingSource {
            id,
            samples,
            start_frame,
            length,
        });
    }

    fn remove(&mut self, id: SourceId) {
        self.sources.retain(|source| source.id != id);
    }

    fn render(&mut self, frames: usize) -> &[f32] {
        self.mix.clear();
        self.mix.resize(frames, 0.0);

        let window_start = self.frames_played;
        let window_end = window_start + frames as u64;
        // Linear interpolation when the device does not run at the source rate
        let step = self.source_rate as f64 / self.device_rate as f64;

        for source in &self.sources {
            let begin = source.start_frame.max(window_start);
            let end = (source.start_frame + source.length).min(window_end);
            for frame in begin..end {
                let position = (frame - source.start_frame) as f64 * step;
                let index = position.floor() as usize;
                let fract = (position - index as f64) as f32;
                let a = source.samples.get(index).copied().unwrap_or(0.0);
                let b = source.samples.get(index + 1).copied().unwrap_or(a);
                self.mix[(frame - window_start) as usize] += a * (1.0 - fract) + b * fract;
            }
        }

        self.frames_played = window_end;

        let completions = &self.completions;
        self.sources.retain(|source| {
            if source.start_frame + source.length <= window_end {
                // Receiver gone means the session is tearing down
                let _ = completions.send(source.id);
                false
            } else {
                true
            }
        });

        self.tap.write(&self.mix);
        &self.mix
    }
}

/// Output device backed by cpal. The stream lives on a dedicated thread for
/// as long as the graph is open.
#[derive(Debug, Default, Clone)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl OutputDevice for CpalOutput {
    async fn open(
        &self,
        config: &VoiceConfig,
        tap: Analyser,
        completions: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputGraph>> {
        let source_rate = config.playback_sample_rate;
        let device_name = config.output_device.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = channel();

        let audio_thread = thread::Builder::new()
            .name("council-audio-out".to_string())
            .spawn(move || {
                run_output_thread(device_name, source_rate, tap, completions, ready_tx, stop_rx)
            })?;

        let (device_rate, mixer) = ready_rx.await.map_err(|_| {
            VoiceError::DeviceUnavailable("Output thread exited before opening".to_string())
        })??;

        log::info!(
            "AudioSink: Output graph open ({}Hz sources on a {}Hz device)",
            source_rate,
            device_rate
        );

        Ok(Box::new(CpalGraph {
            mixer,
            device_rate,
            source_rate,
            stop_tx: Some(stop_tx),
            audio_thread: Some(audio_thread),
        }))
    }
}

type Ready = oneshot::Sender<Result<(u32, Arc<Mutex<Mixer>>)>>;

fn run_output_thread(
    device_name: Option<String>,
    source_rate: u32,
    tap: Analyser,
    completions: mpsc::UnboundedSender<SourceId>,
    ready: Ready,
    stop_rx: Receiver<()>,
) {
    log::debug!("AudioSink: Audio thread started");
    match start_stream(device_name.as_deref(), source_rate, tap, completions) {
        Ok((stream, device_rate, mixer)) => {
            if ready.send(Ok((device_rate, mixer))).is_err() {
                return;
            }
            // Returns on an explicit stop or when the graph handle is dropped
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("AudioSink: Audio thread exiting");
        }
        Err(e) => {
            log::error!("AudioSink: Failed to open output: {}", e);
            let _ = ready.send(Err(e));
        }
    }
}

fn start_stream(
    device_name: Option<&str>,
    source_rate: u32,
    tap: Analyser,
    completions: mpsc::UnboundedSender<SourceId>,
) -> Result<(cpal::Stream, u32, Arc<Mutex<Mixer>>)> {
    let host = cpal::default_host();
    log::debug!("AudioSink: Using audio host: {:?}", host.id());

    let device = match device_name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                VoiceError::DeviceUnavailable(format!("Output device '{}' not found", name))
            })?,
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No output device found".to_string()))?,
    };
    log::debug!("AudioSink: Using output device: {:?}", device.name());

    let supported = select_output_config(&device, source_rate)?;
    let stream_config = supported.config();
    let device_rate = stream_config.sample_rate.0;

    let mixer = Arc::new(Mutex::new(Mixer::new(
        device_rate,
        source_rate,
        tap,
        completions,
    )));

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, mixer.clone())?,
        SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, mixer.clone())?,
        SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, mixer.clone())?,
        format => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "Unsupported output sample format: {:?}",
                format
            )))
        }
    };
    stream.play()?;

    Ok((stream, device_rate, mixer))
}

/// Prefer a config that runs at the source rate; fall back to the device default.
fn select_output_config(
    device: &cpal::Device,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let exact = device
        .supported_output_configs()?
        .filter(|range| {
            matches!(
                range.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
            )
        })
        .find(|range| {
            range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
        })
        .map(|range| range.with_sample_rate(cpal::SampleRate(preferred_rate)));

    match exact {
        Some(config) => Ok(config),
        None => {
            let config = device.default_output_config()?;
            log::info!(
                "AudioSink: {}Hz not supported, resampling to {}Hz",
                preferred_rate,
                config.sample_rate().0
            );
            Ok(config)
        }
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            match mixer.lock() {
                Ok(mut mixer) => {
                    let mix = mixer.render(frames);
                    for (frame, &sample) in data.chunks_mut(channels).zip(mix.iter()) {
                        let value = T::from_sample(sample.clamp(-1.0, 1.0));
                        for slot in frame.iter_mut() {
                            *slot = value;
                        }
                    }
                }
                Err(_) => data.iter_mut().for_each(|slot| *slot = T::EQUILIBRIUM),
            }
        },
        move |err| {
            log::error!("AudioSink: Stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

struct CpalGraph {
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
    source_rate: u32,
    stop_tx: Option<Sender<()>>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl OutputGraph for CpalGraph {
    fn current_time(&self) -> f64 {
        self.mixer
            .lock()
            .map(|mixer| mixer.current_time())
            .unwrap_or_default()
    }

    fn sample_rate(&self) -> u32 {
        self.source_rate
    }

    fn start_source(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> Result<()> {
        if self.stop_tx.is_none() {
            return Err(VoiceError::DeviceUnavailable(
                "Output graph is closed".to_string(),
            ));
        }
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| VoiceError::DeviceUnavailable("Output mixer poisoned".to_string()))?;
        log::debug!(
            "AudioSink: Source {} ({} samples) at {:.3}s on a {}Hz device",
            id,
            samples.len(),
            at,
            self.device_rate
        );
        mixer.insert(id, samples, at);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.remove(id);
        }
    }

    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            log::debug!("AudioSink: Closing output graph");
            if let Ok(mut mixer) = self.mixer.lock() {
                mixer.sources.clear();
            }
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("AudioSink: Failed to join audio thread: {:?}", e);
            }
        }
    }
}

impl Drop for CpalGraph {
    fn drop(&mut self) {
        self.close();
    }
}
