//! Energy readings, voice-activity state and the radial frame they drive.

pub mod render;

use crate::analyser::{mean_magnitude, Analyser};
use strum::Display;

pub use render::{render_frame, Bar, FrameSink, LogFrameSink, Rgb, VisualFrame, BAR_COUNT};

/// Above this mean (0..=255 scale) the tap counts as active.
pub const ACTIVITY_THRESHOLD: f32 = 10.0;
/// Above this output mean the output tap drives the render.
pub const DOMINANCE_THRESHOLD: f32 = 5.0;

/// Voice activity, recomputed every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ActivityState {
    #[default]
    Idle,
    Listening,
    Speaking,
}

/// Which tap's data feeds the render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Tap {
    Input,
    Output,
}

/// Output is checked first: a quiet-but-nonzero output never masks listening.
pub fn derive_activity(input_mean: f32, output_mean: f32) -> ActivityState {
    if output_mean > ACTIVITY_THRESHOLD {
        ActivityState::Speaking
    } else if input_mean > ACTIVITY_THRESHOLD {
        ActivityState::Listening
    } else {
        ActivityState::Idle
    }
}

pub fn dominant_tap(output_mean: f32) -> Tap {
    if output_mean > DOMINANCE_THRESHOLD {
        Tap::Output
    } else {
        Tap::Input
    }
}

/// One tick's worth of analyser data.
#[derive(Debug, Clone, Default)]
pub struct EnergyReading {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub input_mean: f32,
    pub output_mean: f32,
}

impl EnergyReading {
    pub fn from_data(input: Vec<u8>, output: Vec<u8>) -> Self {
        let input_mean = mean_magnitude(&input);
        let output_mean = mean_magnitude(&output);
        Self {
            input,
            output,
            input_mean,
            output_mean,
        }
    }

    /// Sample both taps. Missing taps read as empty arrays.
    pub fn sample(input: Option<&Analyser>, output: Option<&Analyser>) -> Self {
        let input = input.map(Analyser::byte_frequency_data).unwrap_or_default();
        let output = output.map(Analyser::byte_frequency_data).unwrap_or_default();
        Self::from_data(input, output)
    }

    pub fn activity(&self) -> ActivityState {
        derive_activity(self.input_mean, self.output_mean)
    }

    pub fn dominant(&self) -> Tap {
        dominant_tap(self.output_mean)
    }

    pub fn dominant_data(&self) -> &[u8] {
        match self.dominant() {
            Tap::Input => &self.input,
            Tap::Output => &self.output,
        }
    }

    pub fn dominant_mean(&self) -> f32 {
        match self.dominant() {
            Tap::Input => self.input_mean,
            Tap::Output => self.output_mean,
        }
    }
}
