//! Producer loop.
//!
//! ## States
//!
//! ```text
//! Priming   step the engine back to back until the ring holds `prefill`
//!           samples, or `max_prime_attempts` steps have run (underfill is
//!           logged and counted, then streaming starts anyway)
//! Streaming once per tick: apply queued controls, step, write with
//!           backpressure, then wait for the next tick on the coordinator
//!           condvar (skipped while below the low watermark)
//! Draining  stop requested: no more production; the reader empties the ring
//!           for at most `drain_timeout`
//! Stopped   leftovers discarded, thread exits
//! ```
//!
//! A failing or malformed engine step never ends the stream: the block is
//! replaced by silence and counted as a production fault.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, trace, warn};

use super::{diagnostics::StreamDiagnostics, StatusCell, StreamConfig};
use crate::{
    audio::resample::RateConverter,
    buffering::coordinator::{BufferCoordinator, TickWake, WriteOutcome},
    events::StreamStatus,
    synth::SynthesisEngine,
};

/// Requests from the control surface, applied on the producer thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetParameter { name: String, value: f64 },
    Reset,
}

/// Everything the producer thread owns, moved in as one value.
pub(crate) struct ProducerContext<E> {
    pub config: StreamConfig,
    pub engine: E,
    pub coordinator: Arc<BufferCoordinator>,
    pub control_rx: Receiver<ControlCommand>,
    pub status: Arc<StatusCell>,
    pub diagnostics: Arc<StreamDiagnostics>,
}

/// Per-run state that is not shared with anyone.
struct Producer<E> {
    ctx: ProducerContext<E>,
    resampler: RateConverter,
    /// Seconds of engine time per step.
    step_secs: f64,
    /// Device-rate length of a silence substitute.
    silence_len: usize,
    last_stats: Instant,
}

/// Run the producer until a stop is requested and the ring has drained.
pub(crate) fn run<E: SynthesisEngine>(ctx: ProducerContext<E>) {
    info!("producer started");

    let engine_rate = ctx.engine.sample_rate();
    let step_secs = ctx.config.block_secs();
    let engine_chunk = ((step_secs * f64::from(engine_rate)).round() as usize).max(1);

    let resampler = match RateConverter::new(engine_rate, ctx.config.sample_rate, engine_chunk) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            ctx.status.set(StreamStatus::Error, Some(e.to_string()));
            ctx.coordinator.mark_primed();
            ctx.coordinator.mark_finished();
            return;
        }
    };

    let mut producer = Producer {
        silence_len: ctx.config.block_frames,
        ctx,
        resampler,
        step_secs,
        last_stats: Instant::now(),
    };

    if let Err(e) = producer.ctx.engine.warm_up() {
        warn!("engine warm-up failed, continuing: {e}");
    }

    let pending = producer.prime();
    producer.ctx.coordinator.mark_primed();
    producer.ctx.status.set(StreamStatus::Streaming, None);
    info!(occupied = producer.ctx.coordinator.occupied(), "streaming");

    let unwritten = producer.stream(pending);
    producer.drain(unwritten);
}

impl<E: SynthesisEngine> Producer<E> {
    /// Fill to the prefill target without any reader. Returns a block that
    /// did not fit under the high watermark, to be written once streaming.
    fn prime(&mut self) -> Option<Vec<i16>> {
        let prefill = self.ctx.config.prefill;
        let max_attempts = self.ctx.config.max_prime_attempts;
        let mut attempts = 0u32;
        let mut pending = None;

        while attempts < max_attempts && !self.ctx.coordinator.stop_requested() {
            if self.ctx.coordinator.occupied() >= prefill {
                break;
            }
            attempts += 1;
            self.apply_controls();
            let samples = self.produce();
            if samples.is_empty() {
                continue;
            }
            if !self.ctx.coordinator.fits(samples.len()) {
                pending = Some(samples);
                break;
            }
            self.commit(&samples);
        }

        let occupied = self.ctx.coordinator.occupied();
        if occupied < prefill && pending.is_none() {
            StreamDiagnostics::bump(&self.ctx.diagnostics.prime_underfills);
            warn!(
                occupied,
                prefill, attempts, "priming underfilled; streaming anyway"
            );
        } else {
            debug!(occupied, attempts, "primed");
        }
        pending
    }

    /// Returns the length of a block carried from priming that a stop
    /// request overtook before it could be written.
    fn stream(&mut self, mut pending: Option<Vec<i16>>) -> usize {
        let tick = self.ctx.config.tick();
        let low = self.ctx.config.low_watermark;
        let mut next_tick = Instant::now() + tick;

        loop {
            self.apply_controls();
            if self.ctx.coordinator.stop_requested() {
                break;
            }

            let samples = match pending.take() {
                Some(samples) => samples,
                None => self.produce(),
            };
            if !self.commit(&samples) {
                break;
            }
            self.maybe_log_stats();

            // An engine that produced nothing must not be re-stepped in a
            // tight loop, so catch-up only applies after real progress.
            let progressed = !samples.is_empty();
            if progressed && self.ctx.coordinator.occupied() < low {
                StreamDiagnostics::bump(&self.ctx.diagnostics.catch_up_steps);
                trace!("below low watermark, skipping cadence wait");
                next_tick = Instant::now() + tick;
                continue;
            }

            match self.ctx.coordinator.wait_tick(next_tick, progressed) {
                TickWake::StopRequested => break,
                TickWake::CatchUp => {
                    StreamDiagnostics::bump(&self.ctx.diagnostics.catch_up_steps);
                    next_tick = Instant::now() + tick;
                }
                TickWake::Deadline => {
                    next_tick += tick;
                    // Never try to make up more than one missed tick at once.
                    let now = Instant::now();
                    if next_tick < now {
                        next_tick = now + tick;
                    }
                }
            }
        }
        pending.map_or(0, |p| p.len())
    }

    /// `unwritten` is device-rate output that never reached the ring; it is
    /// counted as dropped along with input still held by the resampler.
    fn drain(&mut self, unwritten: usize) {
        let occupied = self.ctx.coordinator.occupied();
        self.ctx.status.set(
            StreamStatus::Draining,
            Some(format!("{occupied} samples buffered")),
        );
        info!(occupied, "draining");

        let left = self
            .ctx
            .coordinator
            .wait_drained(self.ctx.config.drain_timeout());
        if left > 0 && self.ctx.coordinator.active_reader().is_some() {
            warn!(left, "drain timed out; discarding remainder");
        }

        let discarded =
            self.ctx.coordinator.mark_finished() + unwritten + self.resampler_backlog();
        if discarded > 0 {
            StreamDiagnostics::add(&self.ctx.diagnostics.dropped_samples, discarded);
        }
        self.log_stats();
        self.ctx.status.set(StreamStatus::Stopped, None);
        info!(discarded, "producer stopped");
    }

    /// Input held by the resampler, expressed in device-rate samples.
    fn resampler_backlog(&self) -> usize {
        let held = self.resampler.pending_len();
        if held == 0 {
            return 0;
        }
        let ratio =
            f64::from(self.ctx.config.sample_rate) / f64::from(self.ctx.engine.sample_rate());
        (held as f64 * ratio).round() as usize
    }

    /// One engine step, validated and converted to device rate. Faults and
    /// malformed blocks come back as silence.
    fn produce(&mut self) -> Vec<i16> {
        StreamDiagnostics::bump(&self.ctx.diagnostics.blocks_produced);
        let expected_rate = self.ctx.engine.sample_rate();
        let capacity = self.ctx.config.capacity;

        let fault = match self.ctx.engine.step(self.step_secs) {
            Ok(block) if block.sample_rate != expected_rate => format!(
                "block at {} Hz from an engine declared at {} Hz",
                block.sample_rate, expected_rate
            ),
            Ok(block) if block.len() > capacity => format!(
                "block of {} samples exceeds ring capacity {}",
                block.len(),
                capacity
            ),
            Ok(block) => {
                trace!(samples = block.len(), "block produced");
                return if self.resampler.is_passthrough() {
                    block.samples
                } else {
                    self.resampler.process_block(&block.samples)
                };
            }
            Err(e) => e.to_string(),
        };

        StreamDiagnostics::bump(&self.ctx.diagnostics.production_faults);
        warn!(fault = %fault, "production fault; substituting silence");
        vec![0; self.silence_len]
    }

    /// Write with backpressure. Returns `false` when the write was cut short
    /// by a stop request.
    fn commit(&mut self, samples: &[i16]) -> bool {
        let outcome = self
            .ctx
            .coordinator
            .write_block(samples, self.ctx.config.stall_timeout());
        let diag = &self.ctx.diagnostics;
        match outcome {
            WriteOutcome::Written(written) => {
                StreamDiagnostics::add(&diag.samples_written, written);
                if written < samples.len() {
                    StreamDiagnostics::add(&diag.dropped_samples, samples.len() - written);
                }
                true
            }
            WriteOutcome::Stalled { dropped } => {
                StreamDiagnostics::bump(&diag.stall_faults);
                StreamDiagnostics::add(&diag.dropped_samples, dropped);
                warn!(
                    dropped,
                    occupied = self.ctx.coordinator.occupied(),
                    timeout_ms = self.ctx.config.stall_timeout_ms,
                    "stall fault: no space freed in time, block dropped"
                );
                true
            }
            WriteOutcome::Interrupted { dropped } => {
                StreamDiagnostics::add(&diag.dropped_samples, dropped);
                debug!(dropped, "write interrupted by stop request");
                false
            }
        }
    }

    fn apply_controls(&mut self) {
        while let Ok(command) = self.ctx.control_rx.try_recv() {
            match command {
                ControlCommand::SetParameter { name, value } => {
                    match self.ctx.engine.set_control_parameter(&name, value) {
                        Ok(()) => debug!(name = %name, value, "control parameter applied"),
                        Err(e) => warn!(name = %name, value, "control parameter rejected: {e}"),
                    }
                }
                ControlCommand::Reset => {
                    self.ctx.engine.reset();
                    self.resampler.reset();
                    debug!("engine reset");
                }
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed() >= self.ctx.config.stats_interval() {
            self.log_stats();
        }
    }

    fn log_stats(&mut self) {
        self.last_stats = Instant::now();
        let s = self.ctx.diagnostics.snapshot();
        debug!(
            occupied = self.ctx.coordinator.occupied(),
            blocks = s.blocks_produced,
            written = s.samples_written,
            delivered = s.samples_delivered,
            callbacks = s.callbacks,
            underruns = s.underruns,
            lock_misses = s.lock_misses,
            stalls = s.stall_faults,
            faults = s.production_faults,
            catch_up = s.catch_up_steps,
            peak = s.peak_occupancy,
            "stream stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::block::SampleBlock;
    use crate::buffering::coordinator::{ReadOutcome, ReaderMode};
    use crate::error::{ExhaustError, Result};
    use crate::events::StreamStatus;
    use crate::engine::AudioStream;
    use std::time::Duration;

    /// Emits an increasing ramp; every `fail_every`-th step fails.
    struct ScriptedEngine {
        next: i16,
        steps: u32,
        fail_every: Option<u32>,
        wrong_rate: bool,
        applied: Arc<parking_lot::Mutex<Vec<(String, f64)>>>,
    }

    impl ScriptedEngine {
        fn new() -> Self {
            Self {
                next: 1,
                steps: 0,
                fail_every: None,
                wrong_rate: false,
                applied: Arc::default(),
            }
        }
    }

    impl SynthesisEngine for ScriptedEngine {
        fn sample_rate(&self) -> u32 {
            44_100
        }

        fn step(&mut self, dt: f64) -> Result<SampleBlock> {
            self.steps += 1;
            if self.fail_every.is_some_and(|n| self.steps % n == 0) {
                return Err(ExhaustError::Production("scripted failure".into()));
            }
            let n = (dt * 44_100.0).round() as usize;
            let samples = (0..n)
                .map(|_| {
                    let s = self.next;
                    self.next = self.next.wrapping_add(1).max(1);
                    s
                })
                .collect();
            let rate = if self.wrong_rate { 22_050 } else { 44_100 };
            Ok(SampleBlock::new(samples, rate))
        }

        fn set_control_parameter(&mut self, name: &str, value: f64) -> Result<()> {
            if name != "gain" {
                return Err(ExhaustError::UnknownParameter(name.into()));
            }
            self.applied.lock().push((name.to_string(), value));
            Ok(())
        }

        fn reset(&mut self) {
            self.next = 1;
        }
    }

    fn config() -> StreamConfig {
        StreamConfig {
            capacity: 8_000,
            prefill: 882,
            high_watermark: 1_764,
            low_watermark: 441,
            block_frames: 441,
            callback_frames: 441,
            tick_ms: Some(2),
            stall_timeout_ms: 50,
            drain_timeout_ms: 200,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn primes_to_prefill_without_a_reader() {
        let stream = AudioStream::new(config()).unwrap();
        stream.start(ScriptedEngine::new()).unwrap();
        assert!(stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)));
        assert!(stream.occupied() >= 882);
        assert!(stream.occupied() <= 1_764);
        assert_eq!(stream.diagnostics_snapshot().prime_underfills, 0);
        stream.stop().unwrap();
        assert_eq!(stream.status(), StreamStatus::Stopped);
    }

    #[test]
    fn engine_faults_become_silence_and_stream_continues() {
        let stream = AudioStream::new(config()).unwrap();
        let drain = stream.export_drain().unwrap();
        let mut engine = ScriptedEngine::new();
        engine.fail_every = Some(2);
        stream.start(engine).unwrap();

        let lease = drain.lease();
        let mut got = Vec::new();
        let mut buf = vec![0i16; 441];
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.len() < 441 * 6 && Instant::now() < deadline {
            lease.wait_readable(441, Duration::from_millis(100));
            if let ReadOutcome::Delivered { samples, .. } = lease.read_into(&mut buf) {
                got.extend_from_slice(&buf[..samples]);
            }
        }
        stream.stop().unwrap();

        assert!(got.len() >= 441 * 6);
        assert!(got[441..882].iter().all(|&s| s == 0), "second block should be silence");
        assert!(got[..441].iter().all(|&s| s != 0));
        assert!(stream.diagnostics_snapshot().production_faults >= 3);
    }

    #[test]
    fn wrong_rate_blocks_are_treated_as_faults() {
        let stream = AudioStream::new(config()).unwrap();
        let mut engine = ScriptedEngine::new();
        engine.wrong_rate = true;
        stream.start(engine).unwrap();
        assert!(stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)));
        stream.stop().unwrap();
        let snap = stream.diagnostics_snapshot();
        assert!(snap.production_faults >= 2);
        assert_eq!(snap.production_faults, snap.blocks_produced);
    }

    #[test]
    fn prime_gives_up_after_bounded_attempts() {
        struct Mute;
        impl SynthesisEngine for Mute {
            fn sample_rate(&self) -> u32 {
                44_100
            }
            fn step(&mut self, _dt: f64) -> Result<SampleBlock> {
                Ok(SampleBlock::new(Vec::new(), 44_100))
            }
            fn set_control_parameter(&mut self, name: &str, _value: f64) -> Result<()> {
                Err(ExhaustError::UnknownParameter(name.into()))
            }
            fn reset(&mut self) {}
        }

        let stream = AudioStream::new(StreamConfig {
            max_prime_attempts: 5,
            ..config()
        })
        .unwrap();
        stream.start(Mute).unwrap();
        assert!(stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)));
        assert_eq!(stream.diagnostics_snapshot().prime_underfills, 1);
        stream.stop().unwrap();
    }

    #[test]
    fn controls_are_applied_on_the_producer_thread() {
        let stream = AudioStream::new(config()).unwrap();
        let engine = ScriptedEngine::new();
        let applied = Arc::clone(&engine.applied);
        stream.start(engine).unwrap();
        assert!(stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)));

        stream.set_control_parameter("gain", 0.25).unwrap();
        // Unknown names are logged by the producer and do not stop it.
        stream.set_control_parameter("rpm", 900.0).unwrap();
        stream.set_control_parameter("gain", 0.75).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while applied.lock().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(stream.is_running());
        stream.stop().unwrap();
        assert_eq!(
            *applied.lock(),
            vec![("gain".to_string(), 0.25), ("gain".to_string(), 0.75)]
        );
    }

    /// Index of the first `1` after the start, i.e. where the ramp restarted.
    fn restart_index(samples: &[i16]) -> Option<usize> {
        samples.iter().skip(1).position(|&s| s == 1).map(|i| i + 1)
    }

    #[test]
    fn reset_restarts_the_engine_without_stopping_the_stream() {
        let stream = AudioStream::new(config()).unwrap();
        let drain = stream.export_drain().unwrap();
        stream.start(ScriptedEngine::new()).unwrap();
        assert!(stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)));

        let lease = drain.lease();
        let mut got = Vec::new();
        let mut buf = vec![0i16; 441];
        let mut reset_sent = false;
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            lease.wait_readable(441, Duration::from_millis(100));
            if let ReadOutcome::Delivered { samples, .. } = lease.read_into(&mut buf) {
                got.extend_from_slice(&buf[..samples]);
            }
            if !reset_sent && got.len() >= 441 * 3 {
                stream.reset_engine().unwrap();
                reset_sent = true;
            }
            if reset_sent && restart_index(&got).is_some_and(|i| got.len() >= i + 441) {
                break;
            }
        }
        assert!(stream.is_running());
        assert_eq!(stream.status(), StreamStatus::Streaming);
        stream.stop().unwrap();

        let restart = restart_index(&got).expect("ramp never restarted after reset");
        assert!(restart >= 441 * 3);
        assert!(got[..restart].windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(&got[restart..restart + 4], &[1, 2, 3, 4]);
        assert_eq!(stream.diagnostics_snapshot().production_faults, 0);
    }

    #[test]
    fn block_overtaken_by_stop_is_counted_as_dropped() {
        let stream = AudioStream::new(StreamConfig {
            stall_timeout_ms: 5_000,
            ..config()
        })
        .unwrap();
        stream.start(ScriptedEngine::new()).unwrap();

        // No reader: the ring fills to the high watermark and the next write
        // blocks waiting for space.
        let deadline = Instant::now() + Duration::from_secs(5);
        while stream.occupied() < 1_764 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(30));
        stream.stop().unwrap();

        let snap = stream.diagnostics_snapshot();
        assert_eq!(snap.stall_faults, 0);
        assert_eq!(snap.samples_delivered, 0);
        assert_eq!(snap.samples_written, 1_764);
        // Everything buffered plus the block that never got in.
        assert_eq!(snap.dropped_samples, 1_764 + 441);
    }

    #[test]
    fn stall_without_reader_is_counted_and_stop_is_prompt() {
        let stream = AudioStream::new(StreamConfig {
            stall_timeout_ms: 10,
            ..config()
        })
        .unwrap();
        stream.start(ScriptedEngine::new()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stream.diagnostics_snapshot().stall_faults == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        stream.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        let snap = stream.diagnostics_snapshot();
        assert!(snap.stall_faults >= 1);
        assert!(snap.dropped_samples > 0);
        assert!(snap.peak_occupancy <= 1_764);
    }

    #[test]
    fn restart_after_stop_is_rejected() {
        let stream = AudioStream::new(config()).unwrap();
        stream.start(ScriptedEngine::new()).unwrap();
        assert!(matches!(
            stream.start(ScriptedEngine::new()),
            Err(ExhaustError::AlreadyRunning)
        ));
        stream.stop().unwrap();
        assert!(matches!(
            stream.start(ScriptedEngine::new()),
            Err(ExhaustError::StreamFinished)
        ));
        assert_eq!(
            stream.coordinator.active_reader(),
            None::<ReaderMode>
        );
    }
}
