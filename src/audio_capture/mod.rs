//! Microphone capture: device access, resampling to the transport rate and
//! fixed-size framing.

pub mod imp_cpal;

use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tokio::sync::mpsc;

pub use imp_cpal::CpalCapture;

/// Device-rate samples handed to the resampler per call
pub const RESAMPLER_CHUNK: usize = 1024;

/// Fixed-size block of mono samples at the capture rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub seq: u64,
}

/// Opens the microphone.
#[async_trait::async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Start capturing. Frames of `config.frame_size` samples at
    /// `config.capture_sample_rate` are pushed into `frames` until the
    /// returned handle is released.
    async fn open(
        &self,
        config: &VoiceConfig,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Box<dyn CaptureHandle>>;
}

pub trait CaptureHandle: Send {
    /// Stop the stream and give the microphone back. Idempotent.
    ///
    /// Blocks until the device thread has exited, which is at most one stop
    /// poll plus the backend's stream teardown. Called from the session's
    /// synchronous `stop`, so the microphone is free once that returns.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

/// Turns arbitrary device-rate buffers into exact, sequenced frames at the
/// target rate.
pub struct Framer {
    resampler: Option<SincFixedIn<f32>>,
    device_pending: Vec<f32>,
    pending: Vec<f32>,
    frame_size: usize,
    seq: u64,
}

impl Framer {
    pub fn new(device_rate: u32, target_rate: u32, frame_size: usize) -> Result<Self> {
        let resampler = if device_rate != target_rate {
            let ratio = target_rate as f64 / device_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLER_CHUNK, 1)
                .map_err(|e| VoiceError::DeviceUnavailable(format!("Resampler: {}", e)))?;
            log::info!(
                "Capture: Resampling {}Hz -> {}Hz (ratio {:.3})",
                device_rate,
                target_rate,
                ratio
            );
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            resampler,
            device_pending: Vec::new(),
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            seq: 0,
        })
    }

    /// Feed device-rate samples, get back every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        match self.resampler.as_mut() {
            None => self.pending.extend_from_slice(samples),
            Some(resampler) => {
                self.device_pending.extend_from_slice(samples);
                while self.device_pending.len() >= RESAMPLER_CHUNK {
                    let chunk: Vec<f32> = self.device_pending.drain(..RESAMPLER_CHUNK).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut channels) => self.pending.append(&mut channels[0]),
                        Err(e) => log::error!("Capture: Resampling error: {}", e),
                    }
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame {
                samples,
                seq: self.seq,
            });
            self.seq += 1;
        }
        frames
    }

    pub fn frames_emitted(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_frames_exactly() {
        let mut framer = Framer::new(16000, 16000, 4096).unwrap();
        assert!(framer.push(&vec![0.1; 4000]).is_empty());

        let frames = framer.push(&vec![0.2; 5000]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples.len() == 4096));
        assert_eq!(frames[0].seq, 0);
        assert_eq!(frames[1].seq, 1);
        assert_eq!(frames[0].samples[3999], 0.1);
        assert_eq!(frames[0].samples[4000], 0.2);
        assert_eq!(framer.frames_emitted(), 2);
    }

    #[test]
    fn test_downsampling_produces_target_rate_frames() {
        let mut framer = Framer::new(48000, 16000, 4096).unwrap();
        // Three seconds at 48kHz is about 48000 samples at 16kHz
        let frames = framer.push(&vec![0.0; 48000 * 3]);
        assert!(frames.len() >= 10 && frames.len() <= 12, "{}", frames.len());
        assert!(frames.iter().all(|f| f.samples.len() == 4096));
        assert!(frames.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }
}
