//! Sample sources.
//!
//! The `SynthesisEngine` trait decouples the producer loop from whatever
//! generates audio: a test tone, a physical simulation, a scripted test
//! double. One producer loop drives them all.
//!
//! `&mut self` on `step` expresses that engines are stateful (phase,
//! simulation state). Engines are moved onto the producer thread and only
//! ever called from there.

pub mod jitter;
pub mod sine;

pub use jitter::JitterEngine;
pub use sine::SineEngine;

use crate::buffering::block::SampleBlock;
use crate::error::Result;

/// Contract for sample-producing backends.
pub trait SynthesisEngine: Send + 'static {
    /// Rate, in Hz, of every block this engine returns.
    fn sample_rate(&self) -> u32;

    /// One-time preparation before the first `step`. Called on the producer
    /// thread before priming.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advance by `dt` seconds and return the samples covering that span.
    ///
    /// Execution time is unbounded from the caller's point of view; the
    /// producer absorbs slow steps with the buffered headroom.
    fn step(&mut self, dt: f64) -> Result<SampleBlock>;

    /// Apply a named runtime parameter (e.g. `"frequency"`).
    ///
    /// # Errors
    /// `ExhaustError::UnknownParameter` for names the engine does not know.
    fn set_control_parameter(&mut self, name: &str, value: f64) -> Result<()>;

    /// Return to the initial state.
    fn reset(&mut self);
}

impl<E: SynthesisEngine + ?Sized> SynthesisEngine for Box<E> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }

    fn step(&mut self, dt: f64) -> Result<SampleBlock> {
        (**self).step(dt)
    }

    fn set_control_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        (**self).set_control_parameter(name, value)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// Converts per-step time deltas to whole sample counts without drift.
///
/// Rounds each step and carries the remainder, so repeated 1/60 s steps at
/// 44.1 kHz produce 735 samples each and odd rates average out exactly.
#[derive(Debug, Clone, Default)]
pub struct StepClock {
    carry: f64,
}

impl StepClock {
    pub fn samples_for(&mut self, dt: f64, sample_rate: u32) -> usize {
        if !dt.is_finite() || dt <= 0.0 {
            return 0;
        }
        let exact = self.carry + dt * f64::from(sample_rate);
        let whole = exact.round().max(0.0);
        self.carry = exact - whole;
        whole as usize
    }

    pub fn reset(&mut self) {
        self.carry = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_clock_hits_exact_block_sizes() {
        let mut clock = StepClock::default();
        for _ in 0..1000 {
            assert_eq!(clock.samples_for(0.01, 44_100), 441);
        }
    }

    #[test]
    fn step_clock_carries_fractions() {
        let mut clock = StepClock::default();
        let total: usize = (0..300).map(|_| clock.samples_for(1.0 / 300.0, 44_100)).sum();
        assert_eq!(total, 44_100);
    }

    #[test]
    fn step_clock_ignores_bad_deltas() {
        let mut clock = StepClock::default();
        assert_eq!(clock.samples_for(-1.0, 48_000), 0);
        assert_eq!(clock.samples_for(f64::NAN, 48_000), 0);
    }
}
