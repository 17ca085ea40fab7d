use super::{ActivityState, EnergyReading, Tap};
use std::f32::consts::TAU;

pub const BAR_COUNT: usize = 64;

const BASE_RADIUS: f32 = 0.35;
const MIN_BAR_LENGTH: f32 = 0.02;
const MAX_BAR_LENGTH: f32 = 0.45;
const GLOW_GAIN: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Linear interpolation towards `other`, `t` clamped to [0, 1]
    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        Rgb(mix(self.0, other.0), mix(self.1, other.1), mix(self.2, other.2))
    }
}

/// Endpoint colors per dominant tap: (quiet, loud)
fn palette(tap: Tap) -> (Rgb, Rgb) {
    match tap {
        Tap::Input => (Rgb(40, 90, 160), Rgb(80, 230, 255)),
        Tap::Output => (Rgb(120, 40, 150), Rgb(255, 170, 60)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    /// Angle in radians, clockwise from 12 o'clock
    pub angle: f32,
    /// Normalized magnitude 0..=1
    pub magnitude: f32,
    /// Length relative to the unit canvas radius
    pub length: f32,
    pub color: Rgb,
}

/// Everything a renderer needs for one redraw, in unit-canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualFrame {
    pub bars: Vec<Bar>,
    pub inner_radius: f32,
    pub glow_radius: f32,
    pub glow_color: Rgb,
    pub activity: ActivityState,
    pub dominant: Tap,
}

pub fn render_frame(reading: &EnergyReading) -> VisualFrame {
    let dominant = reading.dominant();
    let data = reading.dominant_data();
    let (quiet, loud) = palette(dominant);

    let bars = (0..BAR_COUNT)
        .map(|i| {
            // Spread the bins evenly over the bars; empty data renders flat
            let magnitude = if data.is_empty() {
                0.0
            } else {
                data[i * data.len() / BAR_COUNT] as f32 / 255.0
            };
            Bar {
                angle: i as f32 * TAU / BAR_COUNT as f32,
                magnitude,
                length: MIN_BAR_LENGTH + magnitude * (MAX_BAR_LENGTH - MIN_BAR_LENGTH),
                color: quiet.lerp(loud, magnitude),
            }
        })
        .collect();

    let energy = (reading.dominant_mean() / 255.0).clamp(0.0, 1.0);

    VisualFrame {
        bars,
        inner_radius: BASE_RADIUS,
        glow_radius: BASE_RADIUS * (1.0 + energy * GLOW_GAIN),
        glow_color: quiet.lerp(loud, energy),
        activity: reading.activity(),
        dominant,
    }
}

/// Presentation target for rendered frames (window, terminal, test double).
pub trait FrameSink: Send {
    fn present(&mut self, frame: &VisualFrame);
}

/// Logs a compact meter line; used when no window is attached.
#[derive(Debug, Default)]
pub struct LogFrameSink {
    last_activity: Option<ActivityState>,
}

impl FrameSink for LogFrameSink {
    fn present(&mut self, frame: &VisualFrame) {
        if self.last_activity != Some(frame.activity) {
            log::info!("Visualizer: activity -> {}", frame.activity);
            self.last_activity = Some(frame.activity);
        }
        log::trace!(
            "Visualizer: {} tap, glow {:.3}, peak bar {:.2}",
            frame.dominant,
            frame.glow_radius,
            frame
                .bars
                .iter()
                .map(|bar| bar.magnitude)
                .fold(0.0f32, f32::max)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_frame_from_empty_data() {
        let frame = render_frame(&EnergyReading::default());
        assert_eq!(frame.bars.len(), BAR_COUNT);
        assert!(frame.bars.iter().all(|bar| bar.magnitude == 0.0));
        assert!(frame.bars.iter().all(|bar| bar.length == MIN_BAR_LENGTH));
        assert_eq!(frame.glow_radius, frame.inner_radius);
        assert_eq!(frame.activity, ActivityState::Idle);
    }

    #[test]
    fn test_bars_are_evenly_spread() {
        let frame = render_frame(&EnergyReading::default());
        assert_eq!(frame.bars[0].angle, 0.0);
        let step = frame.bars[1].angle - frame.bars[0].angle;
        assert!((step - TAU / 64.0).abs() < 1e-6);
        assert!(frame.bars[63].angle < TAU);
    }

    #[test]
    fn test_loud_output_drives_render() {
        let reading = EnergyReading::from_data(vec![0; 128], vec![255; 128]);
        let frame = render_frame(&reading);
        let (_, loud) = palette(Tap::Output);
        assert_eq!(frame.dominant, Tap::Output);
        assert_eq!(frame.activity, ActivityState::Speaking);
        assert!(frame.bars.iter().all(|bar| bar.color == loud));
        assert!((frame.bars[0].length - MAX_BAR_LENGTH).abs() < 1e-6);
        assert!(frame.glow_radius > frame.inner_radius);
    }

    #[test]
    fn test_color_interpolation_midpoint() {
        let mid = Rgb(0, 100, 200).lerp(Rgb(200, 100, 0), 0.5);
        assert_eq!(mid, Rgb(100, 100, 100));
        assert_eq!(Rgb(1, 2, 3).lerp(Rgb(9, 9, 9), f32::NAN), Rgb(1, 2, 3));
    }
}
