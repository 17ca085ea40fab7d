use super::{AudioFrame, CaptureDevice, CaptureHandle, Framer};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Device buffers queued between the callback and the framing thread
const CALLBACK_QUEUE: usize = 64;
/// Upper bound on how long `release` waits for the framing thread
const STOP_POLL: Duration = Duration::from_millis(20);

/// Microphone capture backed by cpal. The input stream and the framer live on
/// one dedicated thread; the device callback only copies channel 0 out.
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CaptureDevice for CpalCapture {
    async fn open(
        &self,
        config: &VoiceConfig,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureHandle>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let config = config.clone();

        let capture_thread = thread::Builder::new()
            .name("council-audio-in".to_string())
            .spawn(move || run_capture_thread(config, frames, ready_tx, thread_stop))?;

        let device_rate = ready_rx.await.map_err(|_| {
            VoiceError::DeviceUnavailable("Capture thread exited before opening".to_string())
        })??;
        log::info!("Capture: Microphone open at {}Hz", device_rate);

        Ok(Box::new(CpalCaptureHandle {
            stop,
            capture_thread: Some(capture_thread),
        }))
    }
}

fn run_capture_thread(
    config: VoiceConfig,
    frames: mpsc::Sender<AudioFrame>,
    ready: oneshot::Sender<Result<u32>>,
    stop: Arc<AtomicBool>,
) {
    let (buffer_tx, buffer_rx) = sync_channel(CALLBACK_QUEUE);
    let opened = start_stream(config.input_device.as_deref(), config.capture_sample_rate, buffer_tx)
        .and_then(|(stream, device_rate)| {
            let framer = Framer::new(device_rate, config.capture_sample_rate, config.frame_size)?;
            Ok((stream, device_rate, framer))
        });

    let (stream, device_rate, framer) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("Capture: Failed to open microphone: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(device_rate)).is_err() {
        return;
    }

    pump_frames(buffer_rx, framer, frames, &stop);

    drop(stream);
    log::info!("Capture: Microphone released");
}

/// Frame device buffers until stopped or the receiving side goes away.
fn pump_frames(
    buffers: Receiver<Vec<f32>>,
    mut framer: Framer,
    frames: mpsc::Sender<AudioFrame>,
    stop: &AtomicBool,
) {
    'pump: while !stop.load(Ordering::Acquire) {
        let buffer = match buffers.recv_timeout(STOP_POLL) {
            Ok(buffer) => buffer,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        for frame in framer.push(&buffer) {
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    log::warn!("Capture: Frame queue full, dropping frame {}", frame.seq);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break 'pump,
            }
        }
    }
    log::debug!("Capture: Framing stopped after {} frames", framer.frames_emitted());
}

fn start_stream(
    device_name: Option<&str>,
    target_rate: u32,
    buffers: SyncSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                VoiceError::DeviceUnavailable(format!("Input device '{}' not found", name))
            })?,
        None => host.default_input_device().ok_or_else(|| {
            VoiceError::DeviceUnavailable("No default input device found".to_string())
        })?,
    };

    let supported = select_input_config(&device, target_rate)?;
    let stream_config = supported.config();
    let device_rate = stream_config.sample_rate.0;

    log::info!(
        "Capture: Hardware {}Hz, {} channels, {:?} -> {}Hz mono",
        device_rate,
        stream_config.channels,
        supported.sample_format(),
        target_rate
    );

    let stream = match supported.sample_format() {
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, buffers)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, buffers)?,
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, buffers)?,
        format => {
            return Err(VoiceError::DeviceUnavailable(format!(
                "Unsupported input sample format: {:?}",
                format
            )))
        }
    };
    stream.play()?;

    Ok((stream, device_rate))
}

/// Prefer the target rate when the device supports it, otherwise the nearest
/// rate; among equals prefer formats that convert cheaply.
fn select_input_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<cpal::SupportedStreamConfig> = None;
    let mut best_rank = (u32::MAX, u8::MAX);

    for range in device.supported_input_configs()? {
        let format_rank = match range.sample_format() {
            SampleFormat::F32 => 0,
            SampleFormat::I16 => 1,
            SampleFormat::U16 => 2,
            _ => continue,
        };
        let rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        let rank = (rate.abs_diff(target_rate), format_rank);
        if rank < best_rank {
            best_rank = rank;
            best = Some(range.with_sample_rate(cpal::SampleRate(rate)));
        }
    }

    best.ok_or_else(|| {
        VoiceError::DeviceUnavailable("No supported input configs found".to_string())
    })
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffers: SyncSender<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .filter_map(|frame| frame.first())
                .map(|s| f32::from_sample(*s))
                .collect();
            match buffers.try_send(mono) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Capture: Callback queue full, dropping device buffer");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        },
        move |err| {
            log::error!("Capture: Stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

struct CpalCaptureHandle {
    stop: Arc<AtomicBool>,
    capture_thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn release(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.capture_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Capture: Failed to join capture thread: {:?}", e);
            }
        }
    }

    fn is_released(&self) -> bool {
        self.capture_thread.is_none()
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_stops_when_flagged() {
        let (buffer_tx, buffer_rx) = sync_channel(4);
        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let stop = Arc::new(AtomicBool::new(false));
        let framer = Framer::new(16000, 16000, 4).unwrap();

        buffer_tx.send(vec![0.5; 9]).unwrap();
        let pump_stop = stop.clone();
        let pump = thread::spawn(move || pump_frames(buffer_rx, framer, frames_tx, &pump_stop));

        let first = frames_rx.blocking_recv().unwrap();
        let second = frames_rx.blocking_recv().unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));

        let flagged_at = std::time::Instant::now();
        stop.store(true, Ordering::Release);
        pump.join().unwrap();
        // Release joins this thread from async code, so the wait stays short
        assert!(flagged_at.elapsed() < STOP_POLL * 10);
        drop(buffer_tx);
        assert!(frames_rx.blocking_recv().is_none());
    }

    #[test]
    fn test_pump_drops_frames_when_queue_full() {
        let (buffer_tx, buffer_rx) = sync_channel(4);
        let (frames_tx, mut frames_rx) = mpsc::channel(1);
        let framer = Framer::new(16000, 16000, 2).unwrap();

        buffer_tx.send(vec![0.0; 8]).unwrap();
        drop(buffer_tx);
        pump_frames(buffer_rx, framer, frames_tx, &AtomicBool::new(false));

        assert_eq!(frames_rx.blocking_recv().unwrap().seq, 0);
        assert!(frames_rx.blocking_recv().is_none());
    }
}
