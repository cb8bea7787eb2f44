//! `JitterEngine` wraps any engine and makes its `step` cost unpredictable.
//!
//! Reproduces the variable execution latency of a heavy simulation step on
//! demand: every step costs `base_cost`, and with probability `spike_chance`
//! an extra `spike` on top.

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

use super::SynthesisEngine;
use crate::buffering::block::SampleBlock;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterProfile {
    pub base_cost: Duration,
    pub spike: Duration,
    /// Probability in `[0, 1]` that a step also pays `spike`.
    pub spike_chance: f64,
}

impl Default for JitterProfile {
    fn default() -> Self {
        Self {
            base_cost: Duration::from_millis(1),
            spike: Duration::from_millis(25),
            spike_chance: 0.02,
        }
    }
}

pub struct JitterEngine<E> {
    inner: E,
    profile: JitterProfile,
    rng: StdRng,
    spikes: u64,
}

impl<E: SynthesisEngine> JitterEngine<E> {
    pub fn new(inner: E, profile: JitterProfile) -> Self {
        Self::with_rng(inner, profile, StdRng::from_entropy())
    }

    /// Deterministic spike pattern for reproducible runs.
    pub fn seeded(inner: E, profile: JitterProfile, seed: u64) -> Self {
        Self::with_rng(inner, profile, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: E, mut profile: JitterProfile, rng: StdRng) -> Self {
        profile.spike_chance = if profile.spike_chance.is_finite() {
            profile.spike_chance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            inner,
            profile,
            rng,
            spikes: 0,
        }
    }

    /// Number of steps that paid the spike cost so far.
    pub fn spikes(&self) -> u64 {
        self.spikes
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn step_cost(&mut self) -> Duration {
        let mut cost = self.profile.base_cost;
        if self.profile.spike_chance > 0.0 && self.rng.gen_bool(self.profile.spike_chance) {
            self.spikes += 1;
            cost += self.profile.spike;
            trace!(spike_ms = self.profile.spike.as_millis() as u64, "step latency spike");
        }
        cost
    }
}

impl<E: SynthesisEngine> SynthesisEngine for JitterEngine<E> {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn warm_up(&mut self) -> Result<()> {
        self.inner.warm_up()
    }

    fn step(&mut self, dt: f64) -> Result<SampleBlock> {
        let cost = self.step_cost();
        if !cost.is_zero() {
            std::thread::sleep(cost);
        }
        self.inner.step(dt)
    }

    fn set_control_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        self.inner.set_control_parameter(name, value)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}
