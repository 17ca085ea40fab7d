//! Frequency-domain taps on the input and output audio paths.
//!
//! Mirrors the behaviour of a browser `AnalyserNode`: the most recent
//! `fft_size` samples are Blackman-windowed, transformed, smoothed over time
//! and mapped from a decibel range onto 0..=255.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEFAULT_FFT_SIZE: usize = 256;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Smoothing used for the microphone tap
pub const INPUT_SMOOTHING: f32 = 0.5;
/// Output decays slower so the speaking visual is steadier
pub const OUTPUT_SMOOTHING: f32 = 0.7;

struct AnalyserState {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    smoothing: f32,
    window: Vec<f32>,
    samples: VecDeque<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl AnalyserState {
    fn new(fft_size: usize, smoothing: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft,
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            window,
            samples: VecDeque::with_capacity(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    fn write(&mut self, samples: &[f32]) {
        // Only the newest fft_size samples matter
        let keep = samples.len().min(self.fft_size);
        let tail = &samples[samples.len() - keep..];
        while self.samples.len() + tail.len() > self.fft_size {
            self.samples.pop_front();
        }
        self.samples.extend(tail.iter().copied());
    }

    fn byte_frequency_data(&mut self) -> Vec<u8> {
        if self.samples.is_empty() {
            return Vec::new();
        }

        // Zero-pad at the front when fewer than fft_size samples have arrived
        let pad = self.fft_size - self.samples.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { self.samples[i - pad] };
            let sample = if sample.is_finite() { sample } else { 0.0 };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let tau = self.smoothing;

        self.smoothed
            .iter_mut()
            .zip(self.scratch.iter())
            .map(|(previous, bin)| {
                let magnitude = bin.norm() * scale;
                let mut value = tau * *previous + (1.0 - tau) * magnitude;
                if !value.is_finite() {
                    value = 0.0;
                }
                *previous = value;

                if value <= 0.0 {
                    return 0;
                }
                let db = 20.0 * value.log10();
                let scaled = (255.0 / range) * (db - MIN_DECIBELS);
                scaled.floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Cloneable handle to one analyser tap. Writers (audio callbacks, the
/// capture driver) and the redraw tick share the same state.
#[derive(Clone)]
pub struct Analyser {
    inner: Arc<Mutex<AnalyserState>>,
}

impl Analyser {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        assert!(
            fft_size.is_power_of_two() && fft_size >= 32,
            "fft size must be a power of two >= 32"
        );
        Self {
            inner: Arc::new(Mutex::new(AnalyserState::new(fft_size, smoothing))),
        }
    }

    pub fn input() -> Self {
        Self::new(DEFAULT_FFT_SIZE, INPUT_SMOOTHING)
    }

    pub fn output() -> Self {
        Self::new(DEFAULT_FFT_SIZE, OUTPUT_SMOOTHING)
    }

    /// Feed time-domain samples. Never blocks for long; safe from audio callbacks.
    pub fn write(&self, samples: &[f32]) {
        if let Ok(mut state) = self.inner.lock() {
            state.write(samples);
        }
    }

    /// Smoothed magnitude per bin on a 0..=255 scale. Empty until samples arrive.
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        self.inner
            .lock()
            .map(|mut state| state.byte_frequency_data())
            .unwrap_or_default()
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.fft_size / 2)
            .unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.reset();
        }
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("bins", &self.frequency_bin_count())
            .finish()
    }
}

/// Arithmetic mean of a byte magnitude array; 0 for an empty array.
pub fn mean_magnitude(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&v| v as f32).sum::<f32>() / data.len() as f32
}
