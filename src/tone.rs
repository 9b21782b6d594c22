//! Alert tone synthesis.
//!
//! One burst is a square wave stepping high-low-high-low under an
//! exponentially decaying envelope.

use crate::audio::{AudioContext, Burst, ContextState, Voice};
use std::time::Duration;
use tracing::{debug, warn};

/// Shape of one alert burst.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSpec {
    pub high_hz: f32,
    pub low_hz: f32,
    /// Number of frequency steps, alternating high and low
    pub steps: usize,
    pub duration: Duration,
    /// Envelope level at the start of the burst
    pub peak_gain: f32,
    /// Envelope level the decay ends at
    pub floor_gain: f32,
    pub sample_rate: u32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            high_hz: 880.0,
            low_hz: 660.0,
            steps: 4,
            duration: Duration::from_millis(600),
            peak_gain: 0.3,
            floor_gain: 0.001,
            sample_rate: 44_100,
        }
    }
}

impl ToneSpec {
    pub fn frequency_at_step(&self, step: usize) -> f32 {
        if step % 2 == 0 { self.high_hz } else { self.low_hz }
    }

    /// Envelope level `t` into the burst.
    pub fn gain_at(&self, t: Duration) -> f32 {
        let total = self.duration.as_secs_f32();
        if total <= 0.0 {
            return 0.0;
        }
        if self.peak_gain <= 0.0 || self.peak_gain.is_nan() {
            return 0.0;
        }
        let progress = (t.as_secs_f32() / total).clamp(0.0, 1.0);
        let floor = self.floor_gain.max(f32::MIN_POSITIVE).min(self.peak_gain);
        // Exponential ramps can't reach zero; decay towards the floor instead.
        self.peak_gain * (floor / self.peak_gain).powf(progress)
    }

    pub fn sample_count(&self) -> usize {
        (self.duration.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    /// Render the burst into samples.
    pub fn render(&self) -> Burst {
        let total = self.sample_count();
        let steps = self.steps.max(1);
        let per_step = total.div_ceil(steps).max(1);
        let rate = self.sample_rate as f32;

        let mut samples = Vec::with_capacity(total);
        let mut phase = 0.0f32;
        for i in 0..total {
            let freq = self.frequency_at_step(i / per_step);
            phase += freq / rate;
            if phase >= 1.0 {
                phase -= 1.0;
            }
            let square = if phase < 0.5 { 1.0 } else { -1.0 };
            let t = Duration::from_secs_f32(i as f32 / rate);
            samples.push(square * self.gain_at(t));
        }

        Burst {
            samples,
            sample_rate: self.sample_rate,
            steps,
        }
    }
}

/// A burst that is playing right now.
pub struct BurstHandle {
    voice: Box<dyn Voice>,
}

impl BurstHandle {
    /// Zero the burst immediately.
    pub fn silence(&mut self) {
        self.voice.silence();
    }

    pub fn is_sounding(&mut self) -> bool {
        self.voice.is_sounding()
    }
}

/// Plays alert bursts through an unlocked audio context.
pub struct ToneEngine {
    burst: Burst,
}

impl ToneEngine {
    pub fn new(spec: ToneSpec) -> Self {
        Self {
            burst: spec.render(),
        }
    }

    /// Start one burst. Returns `None` without side effects when there is no
    /// running context, and `None` when the platform refuses the burst.
    pub fn play_burst(&self, ctx: Option<&dyn AudioContext>) -> Option<BurstHandle> {
        let Some(ctx) = ctx else {
            debug!("No audio context; burst skipped");
            return None;
        };
        if ctx.state() != ContextState::Running {
            debug!(state = ?ctx.state(), "Audio context not running; burst skipped");
            return None;
        }
        match ctx.play(&self.burst) {
            Ok(voice) => Some(BurstHandle { voice }),
            Err(e) => {
                warn!("Alert burst failed: {}", e);
                None
            }
        }
    }
}

impl Default for ToneEngine {
    fn default() -> Self {
        Self::new(ToneSpec::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_spec() -> ToneSpec {
        ToneSpec {
            sample_rate: 8_000,
            ..ToneSpec::default()
        }
    }

    #[test]
    fn test_burst_length() {
        let burst = small_spec().render();
        assert_eq!(burst.samples.len(), 4_800);
        assert_eq!(burst.steps, 4);
    }

    #[test]
    fn test_step_frequencies_alternate() {
        let spec = ToneSpec::default();
        assert_eq!(spec.frequency_at_step(0), 880.0);
        assert_eq!(spec.frequency_at_step(1), 660.0);
        assert_eq!(spec.frequency_at_step(2), 880.0);
        assert_eq!(spec.frequency_at_step(3), 660.0);
    }

    #[test]
    fn test_envelope_decays_from_peak_to_floor() {
        let spec = ToneSpec::default();
        assert!((spec.gain_at(Duration::ZERO) - 0.3).abs() < 1e-6);
        let end = spec.gain_at(spec.duration);
        assert!((end - 0.001).abs() < 1e-5);
        assert!(spec.gain_at(Duration::from_millis(300)) < spec.gain_at(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_peak_renders_silence() {
        let spec = ToneSpec {
            peak_gain: 0.0,
            ..small_spec()
        };
        let burst = spec.render();
        assert!(burst.samples.iter().all(|s| *s == 0.0));
        assert!(burst.is_silent());
    }

    #[test]
    fn test_square_wave_amplitude_follows_envelope() {
        let spec = small_spec();
        let burst = spec.render();
        let first = burst.samples[0].abs();
        let last = burst.samples[burst.samples.len() - 1].abs();
        assert!(first > 0.29);
        assert!(last < 0.01);
        assert!(burst.samples.iter().all(|s| s.abs() <= spec.peak_gain + 1e-6));
    }

    #[test]
    fn test_high_step_crosses_zero_more_often() {
        let burst = small_spec().render();
        let quarter = burst.samples.len() / 4;
        let flips = |slice: &[f32]| slice.windows(2).filter(|w| w[0].signum() != w[1].signum()).count();
        let high = flips(&burst.samples[..quarter]);
        let low = flips(&burst.samples[quarter..2 * quarter]);
        assert!(high > low);
    }

    #[test]
    fn test_play_burst_without_context() {
        let engine = ToneEngine::new(small_spec());
        assert!(engine.play_burst(None).is_none());
    }
}
