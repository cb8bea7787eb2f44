//! The host-driven reader.
//!
//! `ConsumerCallback::render` is what the audio host calls each time it wants
//! the next block. It runs on a real-time thread, so it:
//! - waits for the coordinator lock for at most the configured budget;
//! - never waits for data;
//! - performs no I/O and logs nothing (counters only);
//! - allocates only if the host asks for a larger block than ever before.
//!
//! On shortfall the last delivered sample is held flat for the rest of the
//! block. The host always gets back exactly the number of frames it asked for.

use std::sync::Arc;
use std::time::Duration;

use crate::audio::convert::{convert_into, sample_to_unit};
use crate::buffering::coordinator::{ReadOutcome, ReaderLease};
use crate::engine::diagnostics::StreamDiagnostics;

/// Scratch size allocated up front; covers typical host block sizes.
const INITIAL_SCRATCH_FRAMES: usize = 4096;

pub struct ConsumerCallback {
    lease: ReaderLease,
    channels: usize,
    sample_rate: u32,
    lock_budget: Duration,
    scratch: Vec<i16>,
    /// Last sample handed to the host; the flat-extension value.
    held: i16,
    diagnostics: Arc<StreamDiagnostics>,
}

impl ConsumerCallback {
    pub(crate) fn new(
        lease: ReaderLease,
        channels: u16,
        sample_rate: u32,
        lock_budget: Duration,
    ) -> Self {
        let diagnostics = Arc::clone(lease.coordinator().diagnostics());
        Self {
            lease,
            channels: usize::from(channels.max(1)),
            sample_rate,
            lock_budget,
            scratch: vec![0; INITIAL_SCRATCH_FRAMES],
            held: 0,
            diagnostics,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fill `out` (interleaved, `channels` wide) completely. Returns the
    /// number of whole frames rendered, `out.len() / channels`.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let frames = out.len() / self.channels;
        StreamDiagnostics::bump(&self.diagnostics.callbacks);

        if self.scratch.len() < frames {
            self.scratch.resize(frames, 0);
        }
        let scratch = &mut self.scratch[..frames];

        let got = match self.lease.try_read_into(scratch, self.lock_budget) {
            ReadOutcome::LockMissed => {
                StreamDiagnostics::bump(&self.diagnostics.lock_misses);
                0
            }
            ReadOutcome::Warming => 0,
            ReadOutcome::Delivered { samples, streaming } => {
                StreamDiagnostics::add(&self.diagnostics.samples_delivered, samples);
                if samples < frames && streaming {
                    StreamDiagnostics::bump(&self.diagnostics.underruns);
                    StreamDiagnostics::add(&self.diagnostics.underrun_frames, frames - samples);
                }
                samples
            }
        };

        if got > 0 {
            self.held = scratch[got - 1];
        }
        scratch[got..].fill(self.held);

        let written = convert_into(scratch, self.channels, out);
        // A host buffer that is not a whole number of frames gets the held
        // value in its trailing slots.
        out[written * self.channels..].fill(sample_to_unit(self.held));
        frames
    }

    /// Last sample delivered (or held) so far.
    pub fn held_sample(&self) -> i16 {
        self.held
    }
}

impl std::fmt::Debug for ConsumerCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCallback")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("held", &self.held)
            .finish()
    }
}
