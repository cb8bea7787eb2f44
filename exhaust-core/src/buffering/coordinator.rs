//! Synchronization contract between the producer thread and the single reader.
//!
//! ```text
//!  ProducerLoop ──write_block──▶ ┌──────────────────────────────┐
//!        ▲                       │ Mutex<Shared>                │
//!        │ Condvar (space)       │   RingBuffer<i16>            │ ──ReaderLease──▶ Live callback
//!        └────────────────────── │   reader mode, primed, stop  │        or        Export drain
//!                                └──────────────────────────────┘
//! ```
//!
//! One mutex guards the ring and every flag; one condvar carries both the
//! "space freed" and the "data available" wake-ups. Every waiter re-checks its
//! predicate after waking.
//!
//! Watermarks:
//! - the producer never fills above `high` (backpressure, see [`write_block`]);
//! - no reader sees data until the producer has primed to `prefill`;
//! - below `low` the producer skips its cadence wait to catch up
//!   (see [`wait_tick`]).
//!
//! [`write_block`]: BufferCoordinator::write_block
//! [`wait_tick`]: BufferCoordinator::wait_tick

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RingBuffer;
use crate::engine::{diagnostics::StreamDiagnostics, StreamConfig};
use crate::error::{ExhaustError, Result};

/// Who is allowed to drain the ring. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderMode {
    /// Real-time host callback feeding the output device.
    Live,
    /// Non-real-time drain persisting samples (WAV export).
    Export,
}

impl ReaderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReaderMode::Live => "live",
            ReaderMode::Export => "export",
        }
    }
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds the coordinator enforces itself; prefill is tracked by the
/// producer through `mark_primed`.
#[derive(Debug, Clone, Copy)]
struct Watermarks {
    high: usize,
    low: usize,
}

/// Result of a producer write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// Space did not free up within the stall timeout; the block was dropped.
    Stalled { dropped: usize },
    /// A stop request arrived while waiting for space; the block was dropped.
    Interrupted { dropped: usize },
}

/// Result of a reader pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The lock was not acquired within the caller's budget. Nothing consumed.
    LockMissed,
    /// Priming has not finished. Nothing consumed.
    Warming,
    /// `samples` were copied out. `streaming` is false once a stop was
    /// requested, so a drained-out tail is not reported as an underrun.
    Delivered { samples: usize, streaming: bool },
}

/// Why [`BufferCoordinator::wait_tick`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickWake {
    Deadline,
    /// Occupancy dropped below the low watermark.
    CatchUp,
    StopRequested,
}

struct Shared {
    ring: RingBuffer<i16>,
    reader: Option<ReaderMode>,
    primed: bool,
    stop_requested: bool,
    finished: bool,
    waiters: usize,
}

/// Owned per stream; no process-wide state.
pub struct BufferCoordinator {
    shared: Mutex<Shared>,
    cond: Condvar,
    marks: Watermarks,
    diagnostics: Arc<StreamDiagnostics>,
}

impl BufferCoordinator {
    /// Build a coordinator for `config`, rejecting deadlock-prone watermarks.
    pub fn new(config: &StreamConfig, diagnostics: Arc<StreamDiagnostics>) -> Result<Arc<Self>> {
        config.validate()?;
        let ring = RingBuffer::with_capacity(config.capacity)?;
        Ok(Arc::new(Self {
            shared: Mutex::new(Shared {
                ring,
                reader: None,
                primed: false,
                stop_requested: false,
                finished: false,
                waiters: 0,
            }),
            cond: Condvar::new(),
            marks: Watermarks {
                high: config.high_watermark,
                low: config.low_watermark,
            },
            diagnostics,
        }))
    }

    pub fn diagnostics(&self) -> &Arc<StreamDiagnostics> {
        &self.diagnostics
    }

    pub fn occupied(&self) -> usize {
        self.shared.lock().ring.available_to_read()
    }

    pub fn is_primed(&self) -> bool {
        self.shared.lock().primed
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.lock().stop_requested
    }

    pub fn active_reader(&self) -> Option<ReaderMode> {
        self.shared.lock().reader
    }

    // ── Reader ownership ─────────────────────────────────────────────────

    /// Claim the ring for `mode`. Fails with `DualConsumer` while any other
    /// lease (of either mode) is alive.
    pub fn claim_reader(self: &Arc<Self>, mode: ReaderMode) -> Result<ReaderLease> {
        let mut shared = self.shared.lock();
        if let Some(active) = shared.reader {
            return Err(ExhaustError::DualConsumer {
                active: active.as_str(),
                requested: mode.as_str(),
            });
        }
        shared.reader = Some(mode);
        debug!(mode = mode.as_str(), "reader claimed");
        Ok(ReaderLease {
            coordinator: Arc::clone(self),
            mode,
        })
    }

    fn release_reader(&self, mode: ReaderMode) {
        let mut shared = self.shared.lock();
        if shared.reader == Some(mode) {
            shared.reader = None;
            debug!(mode = mode.as_str(), "reader released");
        }
        self.wake(&shared);
    }

    // ── Producer side ────────────────────────────────────────────────────

    /// Whether a block of `len` samples can be written right now without
    /// crossing the high watermark.
    pub fn fits(&self, len: usize) -> bool {
        let shared = self.shared.lock();
        Self::has_room(&shared, &self.marks, len)
    }

    fn has_room(shared: &Shared, marks: &Watermarks, len: usize) -> bool {
        let occupied = shared.ring.available_to_read();
        occupied == 0 || occupied + len <= marks.high
    }

    /// Write one block, waiting on the condvar while it would push occupancy
    /// above the high watermark.
    ///
    /// The wait ends when the reader frees space, when a stop is requested,
    /// or after `stall_timeout`. Only the first case writes; the other two
    /// drop the block and report it.
    pub fn write_block(&self, samples: &[i16], stall_timeout: Duration) -> WriteOutcome {
        if samples.is_empty() {
            return WriteOutcome::Written(0);
        }
        let deadline = Instant::now() + stall_timeout;
        let mut shared = self.shared.lock();

        if !Self::has_room(&shared, &self.marks, samples.len()) {
            shared.waiters += 1;
            while !shared.stop_requested && !Self::has_room(&shared, &self.marks, samples.len()) {
                if self.cond.wait_until(&mut shared, deadline).timed_out()
                    && !Self::has_room(&shared, &self.marks, samples.len())
                {
                    break;
                }
            }
            shared.waiters -= 1;

            if shared.stop_requested {
                return WriteOutcome::Interrupted {
                    dropped: samples.len(),
                };
            }
            if !Self::has_room(&shared, &self.marks, samples.len()) {
                return WriteOutcome::Stalled {
                    dropped: samples.len(),
                };
            }
        }

        let written = shared.ring.write(samples);
        self.diagnostics
            .record_occupancy(shared.ring.available_to_read());
        self.wake(&shared);
        WriteOutcome::Written(written)
    }

    /// Open the ring to the reader. Called once by the producer when priming
    /// ends, whether or not the prefill target was reached.
    pub fn mark_primed(&self) {
        let mut shared = self.shared.lock();
        shared.primed = true;
        self.wake(&shared);
    }

    /// Sleep until `deadline` unless a stop is requested or, when
    /// `catch_up` is set, the reader pulls occupancy below the low watermark
    /// first.
    pub fn wait_tick(&self, deadline: Instant, catch_up: bool) -> TickWake {
        let mut shared = self.shared.lock();
        shared.waiters += 1;
        let wake = loop {
            if shared.stop_requested {
                break TickWake::StopRequested;
            }
            if catch_up && shared.ring.available_to_read() < self.marks.low {
                break TickWake::CatchUp;
            }
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                break if shared.stop_requested {
                    TickWake::StopRequested
                } else {
                    TickWake::Deadline
                };
            }
        };
        shared.waiters -= 1;
        wake
    }

    /// Ask the producer to stop and wake every waiter.
    pub fn request_stop(&self) {
        let mut shared = self.shared.lock();
        shared.stop_requested = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the reader to empty the ring. Returns the
    /// number of samples still buffered (0 on a clean drain). Returns
    /// immediately when no reader is attached, since nothing would drain it.
    pub fn wait_drained(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut shared = self.shared.lock();
        shared.waiters += 1;
        while shared.reader.is_some() && !shared.ring.is_empty() {
            if self.cond.wait_until(&mut shared, deadline).timed_out() {
                break;
            }
        }
        shared.waiters -= 1;
        shared.ring.available_to_read()
    }

    /// Producer has exited. Discards anything left and wakes readers waiting
    /// for data. Returns the number of discarded samples.
    pub fn mark_finished(&self) -> usize {
        let mut shared = self.shared.lock();
        shared.finished = true;
        let discarded = shared.ring.clear();
        self.cond.notify_all();
        discarded
    }

    fn wake(&self, shared: &Shared) {
        if shared.waiters > 0 {
            self.cond.notify_all();
        }
    }

    /// Hold the coordinator lock until the returned guard drops.
    #[cfg(test)]
    pub(crate) fn hold_lock_for_test(&self) -> impl Sized + '_ {
        self.shared.lock()
    }
}

/// Exclusive read access to the ring in one [`ReaderMode`].
///
/// Reads are only reachable through a lease, and every read re-checks the
/// mode flag before touching the ring. Dropping the lease frees the ring for
/// the other mode.
pub struct ReaderLease {
    coordinator: Arc<BufferCoordinator>,
    mode: ReaderMode,
}

impl ReaderLease {
    pub fn mode(&self) -> ReaderMode {
        self.mode
    }

    pub fn coordinator(&self) -> &Arc<BufferCoordinator> {
        &self.coordinator
    }

    /// Real-time pull: waits at most `budget` for the lock, never for data.
    pub fn try_read_into(&self, out: &mut [i16], budget: Duration) -> ReadOutcome {
        let Some(mut shared) = self.coordinator.shared.try_lock_for(budget) else {
            return ReadOutcome::LockMissed;
        };
        self.read_locked(&mut shared, out)
    }

    /// Blocking pull for the non-real-time export path.
    pub fn read_into(&self, out: &mut [i16]) -> ReadOutcome {
        let mut shared = self.coordinator.shared.lock();
        self.read_locked(&mut shared, out)
    }

    fn read_locked(&self, shared: &mut Shared, out: &mut [i16]) -> ReadOutcome {
        if shared.reader != Some(self.mode) {
            return ReadOutcome::Delivered {
                samples: 0,
                streaming: false,
            };
        }
        if !shared.primed {
            return ReadOutcome::Warming;
        }
        let samples = shared.ring.read_into(out);
        self.coordinator.wake(shared);
        ReadOutcome::Delivered {
            samples,
            streaming: !shared.stop_requested,
        }
    }

    /// Block until at least `min` samples are readable, the producer has
    /// finished, or `timeout` elapses. Returns the readable count.
    pub fn wait_readable(&self, min: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut shared = self.coordinator.shared.lock();
        shared.waiters += 1;
        while !shared.finished && !(shared.primed && shared.ring.available_to_read() >= min) {
            if self
                .coordinator
                .cond
                .wait_until(&mut shared, deadline)
                .timed_out()
            {
                break;
            }
        }
        shared.waiters -= 1;
        if shared.primed {
            shared.ring.available_to_read()
        } else {
            0
        }
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.coordinator.release_reader(self.mode);
    }
}

impl fmt::Debug for ReaderLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderLease").field("mode", &self.mode).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn small_config() -> StreamConfig {
        StreamConfig {
            capacity: 64,
            prefill: 16,
            high_watermark: 32,
            low_watermark: 8,
            block_frames: 8,
            callback_frames: 8,
            ..StreamConfig::default()
        }
    }

    fn coordinator(config: &StreamConfig) -> Arc<BufferCoordinator> {
        BufferCoordinator::new(config, Arc::new(StreamDiagnostics::default())).unwrap()
    }

    #[test]
    fn rejects_prefill_at_or_above_high_watermark() {
        let config = StreamConfig {
            prefill: 32,
            ..small_config()
        };
        let err = BufferCoordinator::new(&config, Arc::default()).err().unwrap();
        assert!(matches!(err, ExhaustError::InvalidConfig(_)));
    }

    #[test]
    fn second_reader_is_rejected_in_either_order() {
        let coord = coordinator(&small_config());

        let live = coord.claim_reader(ReaderMode::Live).unwrap();
        match coord.claim_reader(ReaderMode::Export) {
            Err(ExhaustError::DualConsumer { active, requested }) => {
                assert_eq!(active, "live");
                assert_eq!(requested, "export");
            }
            other => panic!("expected DualConsumer, got {other:?}"),
        }
        assert!(coord.claim_reader(ReaderMode::Live).is_err());
        drop(live);

        let _export = coord.claim_reader(ReaderMode::Export).unwrap();
        assert!(matches!(
            coord.claim_reader(ReaderMode::Live),
            Err(ExhaustError::DualConsumer { active: "export", .. })
        ));
    }

    #[test]
    fn reader_sees_nothing_until_primed() {
        let coord = coordinator(&small_config());
        let lease = coord.claim_reader(ReaderMode::Live).unwrap();
        assert_eq!(
            coord.write_block(&[1; 8], Duration::from_millis(10)),
            WriteOutcome::Written(8)
        );

        let mut out = [0i16; 8];
        assert_eq!(
            lease.try_read_into(&mut out, Duration::ZERO),
            ReadOutcome::Warming
        );
        assert_eq!(coord.occupied(), 8);

        coord.mark_primed();
        assert_eq!(
            lease.try_read_into(&mut out, Duration::ZERO),
            ReadOutcome::Delivered {
                samples: 8,
                streaming: true
            }
        );
        assert_eq!(out, [1; 8]);
    }

    #[test]
    fn write_above_high_watermark_stalls_without_a_reader() {
        let coord = coordinator(&small_config());
        for _ in 0..4 {
            assert_eq!(
                coord.write_block(&[0; 8], Duration::from_millis(5)),
                WriteOutcome::Written(8)
            );
        }
        assert!(!coord.fits(8));
        assert_eq!(
            coord.write_block(&[0; 8], Duration::from_millis(20)),
            WriteOutcome::Stalled { dropped: 8 }
        );
        assert_eq!(coord.occupied(), 32);
    }

    #[test]
    fn blocked_writer_resumes_when_reader_frees_space() {
        let coord = coordinator(&small_config());
        let lease = coord.claim_reader(ReaderMode::Live).unwrap();
        for _ in 0..4 {
            coord.write_block(&[0; 8], Duration::from_millis(5));
        }
        coord.mark_primed();

        let writer = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || coord.write_block(&[7; 8], Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let mut out = [0i16; 8];
        lease.read_into(&mut out);

        assert_eq!(writer.join().unwrap(), WriteOutcome::Written(8));
        assert_eq!(coord.occupied(), 32);
    }

    #[test]
    fn stop_request_interrupts_a_blocked_writer() {
        let coord = coordinator(&small_config());
        for _ in 0..4 {
            coord.write_block(&[0; 8], Duration::from_millis(5));
        }
        let writer = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || coord.write_block(&[0; 8], Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        coord.request_stop();
        assert_eq!(
            writer.join().unwrap(),
            WriteOutcome::Interrupted { dropped: 8 }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_tick_returns_early_below_low_watermark() {
        let coord = coordinator(&small_config());
        let far = Instant::now() + Duration::from_secs(30);
        assert_eq!(coord.wait_tick(far, true), TickWake::CatchUp);

        let soon = Instant::now() + Duration::from_millis(10);
        assert_eq!(coord.wait_tick(soon, false), TickWake::Deadline);

        coord.write_block(&[0; 16], Duration::from_millis(5));
        let soon = Instant::now() + Duration::from_millis(10);
        assert_eq!(coord.wait_tick(soon, true), TickWake::Deadline);

        coord.request_stop();
        assert_eq!(coord.wait_tick(far, true), TickWake::StopRequested);
    }

    #[test]
    fn reads_after_stop_are_not_streaming() {
        let coord = coordinator(&small_config());
        let lease = coord.claim_reader(ReaderMode::Export).unwrap();
        coord.write_block(&[3; 8], Duration::from_millis(5));
        coord.mark_primed();
        coord.request_stop();

        let mut out = [0i16; 16];
        assert_eq!(
            lease.read_into(&mut out),
            ReadOutcome::Delivered {
                samples: 8,
                streaming: false
            }
        );
        assert_eq!(coord.wait_drained(Duration::from_millis(5)), 0);
    }

    #[test]
    fn wait_drained_skips_when_no_reader_attached() {
        let coord = coordinator(&small_config());
        coord.write_block(&[0; 8], Duration::from_millis(5));
        let started = Instant::now();
        assert_eq!(coord.wait_drained(Duration::from_secs(10)), 8);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(coord.mark_finished(), 8);
        assert_eq!(coord.occupied(), 0);
    }

    #[test]
    fn wait_readable_wakes_on_write() {
        let coord = coordinator(&small_config());
        let lease = coord.claim_reader(ReaderMode::Export).unwrap();
        coord.mark_primed();

        let writer = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                coord.write_block(&[1; 8], Duration::from_millis(5))
            })
        };
        assert_eq!(lease.wait_readable(8, Duration::from_secs(5)), 8);
        writer.join().unwrap();
    }

    #[test]
    fn peak_occupancy_is_recorded() {
        let diagnostics = Arc::new(StreamDiagnostics::default());
        let coord = BufferCoordinator::new(&small_config(), Arc::clone(&diagnostics)).unwrap();
        coord.write_block(&[0; 8], Duration::from_millis(5));
        coord.write_block(&[0; 8], Duration::from_millis(5));
        assert_eq!(diagnostics.snapshot().peak_occupancy, 16);
    }
}
