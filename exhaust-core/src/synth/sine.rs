//! Phase-continuous test tone.
//!
//! Verifies the audio path end to end without a simulation attached. The
//! first 10 ms fade in linearly so stream start does not click, and the phase
//! accumulator survives frequency changes so sweeps stay continuous.

use std::f64::consts::TAU;

use tracing::debug;

use super::{StepClock, SynthesisEngine};
use crate::audio::convert::unit_to_sample;
use crate::buffering::block::SampleBlock;
use crate::error::{ExhaustError, Result};

pub const DEFAULT_FREQUENCY: f64 = 440.0;
pub const DEFAULT_AMPLITUDE: f64 = 0.5;
pub const MIN_FREQUENCY: f64 = 1.0;
pub const MAX_FREQUENCY: f64 = 22_000.0;
const FADE_IN_SECS: f64 = 0.010;

pub struct SineEngine {
    sample_rate: u32,
    frequency: f64,
    amplitude: f64,
    /// Phase in radians, kept in `[0, TAU)`.
    phase: f64,
    fade_len: usize,
    emitted: usize,
    clock: StepClock,
}

impl SineEngine {
    pub fn new(sample_rate: u32, frequency: f64, amplitude: f64) -> Self {
        Self {
            sample_rate,
            frequency: frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY),
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            fade_len: ((sample_rate as f64 * FADE_IN_SECS) as usize).max(1),
            emitted: 0,
            clock: StepClock::default(),
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    fn next_sample(&mut self) -> i16 {
        let gain = if self.emitted < self.fade_len {
            self.emitted as f64 / self.fade_len as f64
        } else {
            1.0
        };
        let value = self.phase.sin() * self.amplitude * gain;
        self.phase = (self.phase + TAU * self.frequency / self.sample_rate as f64) % TAU;
        self.emitted = self.emitted.saturating_add(1);
        unit_to_sample(value as f32)
    }
}

impl Default for SineEngine {
    fn default() -> Self {
        Self::new(44_100, DEFAULT_FREQUENCY, DEFAULT_AMPLITUDE)
    }
}

impl SynthesisEngine for SineEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn step(&mut self, dt: f64) -> Result<SampleBlock> {
        let n = self.clock.samples_for(dt, self.sample_rate);
        let samples = (0..n).map(|_| self.next_sample()).collect();
        Ok(SampleBlock::new(samples, self.sample_rate))
    }

    fn set_control_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(ExhaustError::Production(format!(
                "non-finite value for {name}: {value}"
            )));
        }
        match name {
            "frequency" => {
                self.frequency = value.clamp(MIN_FREQUENCY, MAX_FREQUENCY);
                debug!(frequency = self.frequency, "sine frequency set");
            }
            "amplitude" => {
                self.amplitude = value.clamp(0.0, 1.0);
                debug!(amplitude = self.amplitude, "sine amplitude set");
            }
            other => return Err(ExhaustError::UnknownParameter(other.to_string())),
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.emitted = 0;
        self.clock.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::sample_to_unit;

    fn max_step(samples: &[i16]) -> f32 {
        samples
            .windows(2)
            .map(|w| (sample_to_unit(w[1]) - sample_to_unit(w[0])).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn block_length_matches_time_delta() {
        let mut sine = SineEngine::default();
        let block = sine.step(0.01).unwrap();
        assert_eq!(block.len(), 441);
        assert_eq!(block.sample_rate, 44_100);
    }

    #[test]
    fn fade_in_starts_from_silence() {
        let mut sine = SineEngine::new(48_000, 1_000.0, 1.0);
        let block = sine.step(0.02).unwrap();
        assert_eq!(block.samples[0], 0);
        let early_peak = block.samples[..48].iter().map(|s| s.unsigned_abs()).max().unwrap();
        let late_peak = block.samples[480..].iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(early_peak < late_peak / 4);
        assert!(late_peak > 32_000);
    }

    #[test]
    fn consecutive_blocks_are_phase_continuous() {
        let mut sine = SineEngine::new(44_100, 440.0, 1.0);
        let mut all = Vec::new();
        for _ in 0..50 {
            all.extend(sine.step(0.01).unwrap().samples);
        }
        // Max slope of a full-scale 440 Hz sine at 44.1 kHz is 2π·440/44100 ≈ 0.0627.
        assert!(max_step(&all) < 0.07);
    }

    #[test]
    fn frequency_change_keeps_phase() {
        let mut sine = SineEngine::new(44_100, 440.0, 1.0);
        let mut all = sine.step(0.05).unwrap().samples;
        sine.set_control_parameter("frequency", 880.0).unwrap();
        all.extend(sine.step(0.05).unwrap().samples);
        assert!(max_step(&all) < 0.13);
    }

    #[test]
    fn parameters_are_clamped_and_validated() {
        let mut sine = SineEngine::default();
        sine.set_control_parameter("frequency", 1e9).unwrap();
        assert_eq!(sine.frequency(), MAX_FREQUENCY);
        sine.set_control_parameter("amplitude", -3.0).unwrap();
        assert_eq!(sine.amplitude(), 0.0);
        assert!(matches!(
            sine.set_control_parameter("rpm", 3000.0),
            Err(ExhaustError::UnknownParameter(name)) if name == "rpm"
        ));
        assert!(sine.set_control_parameter("frequency", f64::NAN).is_err());
    }

    #[test]
    fn reset_restarts_fade() {
        let mut sine = SineEngine::default();
        sine.step(0.1).unwrap();
        sine.reset();
        assert_eq!(sine.step(0.001).unwrap().samples[0], 0);
    }
}
