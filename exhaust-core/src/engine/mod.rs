//! `AudioStream`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AudioStream::new(config)   → watermarks validated, ring allocated, status = Idle
//!     ├─► live_callback() / export_drain()   → claim the single reader
//!     └─► start(engine)      → producer thread spawned, status = Priming → Streaming
//!         └─► stop()         → status = Draining, reader empties ring, thread joined,
//!                              ring discarded, status = Stopped
//! ```
//!
//! A stream is single-use: once stopped, build a new one. Each stream owns its
//! coordinator, so independent streams can coexist in one process.
//!
//! ## Threading
//!
//! The engine is moved onto the producer thread and never touched from
//! anywhere else. Parameter changes travel over a bounded crossbeam channel
//! that the producer drains once per iteration.

pub mod consumer;
pub mod diagnostics;
pub mod producer;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    buffering::coordinator::{BufferCoordinator, ReaderMode},
    error::{ExhaustError, Result},
    events::{StreamStatus, StreamStatusEvent},
    export::ExportDrain,
    synth::SynthesisEngine,
};
use consumer::ConsumerCallback;
use diagnostics::{DiagnosticsSnapshot, StreamDiagnostics};
use producer::{ControlCommand, ProducerContext};

/// Status events buffered for slow subscribers.
const BROADCAST_CAP: usize = 64;
/// Pending parameter changes before `set_control_parameter` reports a full queue.
const CONTROL_QUEUE_CAP: usize = 256;

/// Deployment parameters for one stream. Sample counts are mono samples at
/// `sample_rate`, which is also the device rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct StreamConfig {
    /// Device sample rate (Hz). Engine output is resampled to this.
    pub sample_rate: u32,
    /// Output channels; the mono stream is duplicated into each.
    pub channels: u16,
    /// Ring capacity C.
    pub capacity: usize,
    /// Pre-fill target P: readers see nothing until the ring holds this much.
    pub prefill: usize,
    /// High watermark H: the producer never fills above this.
    pub high_watermark: usize,
    /// Low watermark L: below this the producer skips its cadence wait.
    pub low_watermark: usize,
    /// Samples produced per step.
    pub block_frames: usize,
    /// Producer cadence override. Unset means one block duration, which
    /// matches a host that pulls `block_frames` per block period at any rate.
    /// `Some(0)` means free-running (backpressure only).
    pub tick_ms: Option<u64>,
    /// Expected host request size, used for the H − P slack check.
    pub callback_frames: usize,
    pub max_prime_attempts: u32,
    /// How long a write may wait for space before the block is dropped.
    pub stall_timeout_ms: u64,
    /// How long `stop` lets the reader empty the ring.
    pub drain_timeout_ms: u64,
    /// Longest the real-time callback waits for the coordinator lock.
    pub callback_lock_budget_us: u64,
    /// Interval between diagnostics log lines from the producer.
    pub stats_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            capacity: 96_000,
            prefill: 2_000,
            high_watermark: 4_000,
            low_watermark: 1_000,
            block_frames: 441,
            tick_ms: None,
            callback_frames: 441,
            max_prime_attempts: 64,
            stall_timeout_ms: 500,
            drain_timeout_ms: 1_000,
            callback_lock_budget_us: 200,
            stats_interval_ms: 1_000,
        }
    }
}

impl StreamConfig {
    /// Reject any configuration that could deadlock or starve at runtime.
    ///
    /// Checked relations: `L ≤ P < H < C`, `H − P ≥ callback_frames`, and
    /// `block_frames ≤ H − L` so that one block always fits once the reader
    /// has pulled occupancy down to the low watermark.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ExhaustError::InvalidConfig(msg));

        if self.capacity == 0 {
            return fail("capacity must be greater than zero".into());
        }
        if self.channels == 0 {
            return fail("channels must be at least 1".into());
        }
        if self.sample_rate == 0 {
            return fail("sample_rate must be greater than zero".into());
        }
        if self.block_frames == 0 {
            return fail("block_frames must be greater than zero".into());
        }
        if let Some(ms) = self.tick_ms {
            // ms / 1000 > block_frames / sample_rate, kept in integers
            if ms * u64::from(self.sample_rate) > self.block_frames as u64 * 1_000 {
                return fail(format!(
                    "tick_ms ({ms}) is longer than one block of {} frames at {} Hz ({:.3} ms); \
                     the producer would fall behind the reader",
                    self.block_frames,
                    self.sample_rate,
                    self.block_secs() * 1_000.0
                ));
            }
        }
        if self.low_watermark > self.prefill {
            return fail(format!(
                "low_watermark ({}) must not exceed prefill ({})",
                self.low_watermark, self.prefill
            ));
        }
        if self.prefill >= self.high_watermark {
            return fail(format!(
                "prefill ({}) must be strictly below high_watermark ({}); a full pre-fill \
                 leaves the reader no room and deadlocks the producer",
                self.prefill, self.high_watermark
            ));
        }
        if self.high_watermark >= self.capacity {
            return fail(format!(
                "high_watermark ({}) must be strictly below capacity ({})",
                self.high_watermark, self.capacity
            ));
        }
        if self.high_watermark - self.prefill < self.callback_frames {
            return fail(format!(
                "high_watermark - prefill ({}) must cover one callback of {} frames",
                self.high_watermark - self.prefill,
                self.callback_frames
            ));
        }
        if self.block_frames > self.high_watermark - self.low_watermark {
            return fail(format!(
                "block_frames ({}) must fit between low_watermark ({}) and high_watermark ({})",
                self.block_frames, self.low_watermark, self.high_watermark
            ));
        }
        Ok(())
    }

    /// Producer cadence: the explicit `tick_ms`, or one block duration.
    pub fn tick(&self) -> Duration {
        match self.tick_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.block_duration(),
        }
    }

    pub fn block_duration(&self) -> Duration {
        let nanos = self.block_frames as u64 * 1_000_000_000 / u64::from(self.sample_rate.max(1));
        Duration::from_nanos(nanos)
    }

    /// The same layout at another device rate. Every sample count is scaled
    /// by `rate / sample_rate`, so block duration and watermark margins keep
    /// their length in time.
    pub fn rescaled_to(&self, rate: u32) -> StreamConfig {
        if rate == 0 || self.sample_rate == 0 || rate == self.sample_rate {
            return self.clone();
        }
        let ratio = f64::from(rate) / f64::from(self.sample_rate);
        let scale = |n: usize| (n as f64 * ratio).round() as usize;
        StreamConfig {
            sample_rate: rate,
            capacity: scale(self.capacity).max(1),
            prefill: scale(self.prefill),
            high_watermark: scale(self.high_watermark),
            low_watermark: scale(self.low_watermark),
            block_frames: scale(self.block_frames).max(1),
            callback_frames: scale(self.callback_frames),
            ..self.clone()
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn callback_lock_budget(&self) -> Duration {
        Duration::from_micros(self.callback_lock_budget_us)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Seconds of audio covered by one block at `sample_rate`.
    pub fn block_secs(&self) -> f64 {
        self.block_frames as f64 / self.sample_rate as f64
    }
}

/// Current status plus a condvar so callers can wait for a transition.
pub(crate) struct StatusCell {
    status: Mutex<StreamStatus>,
    changed: Condvar,
    tx: broadcast::Sender<StreamStatusEvent>,
}

impl StatusCell {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Mutex::new(StreamStatus::Idle),
            changed: Condvar::new(),
            tx,
        }
    }

    pub(crate) fn get(&self) -> StreamStatus {
        *self.status.lock()
    }

    pub(crate) fn set(&self, status: StreamStatus, detail: Option<String>) {
        *self.status.lock() = status;
        self.changed.notify_all();
        // No subscribers is fine.
        let _ = self.tx.send(StreamStatusEvent { status, detail });
    }

    fn wait_for(&self, want: StreamStatus, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while *status != want {
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return *status == want;
            }
        }
        true
    }
}

/// The top-level stream handle.
///
/// `AudioStream` is `Send + Sync`; share it behind an `Arc` when the control
/// surface and the host live on different threads.
pub struct AudioStream {
    config: StreamConfig,
    coordinator: Arc<BufferCoordinator>,
    diagnostics: Arc<StreamDiagnostics>,
    status: Arc<StatusCell>,
    control_tx: Sender<ControlCommand>,
    control_rx: Receiver<ControlCommand>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl AudioStream {
    /// Validate `config` and allocate the ring. Nothing runs yet.
    ///
    /// # Errors
    /// `ExhaustError::InvalidConfig` for any deadlock-prone watermark layout.
    pub fn new(config: StreamConfig) -> Result<Self> {
        let diagnostics = Arc::new(StreamDiagnostics::default());
        let coordinator = BufferCoordinator::new(&config, Arc::clone(&diagnostics))?;
        let (control_tx, control_rx) = crossbeam_channel::bounded(CONTROL_QUEUE_CAP);
        Ok(Self {
            config,
            coordinator,
            diagnostics,
            status: Arc::new(StatusCell::new()),
            control_tx,
            control_rx,
            producer: Mutex::new(None),
        })
    }

    /// Spawn the producer thread for `engine`.
    ///
    /// Returns once the thread is running; priming continues in the
    /// background. Use [`wait_for_status`](Self::wait_for_status) to wait for
    /// `Streaming`.
    ///
    /// # Errors
    /// - `AlreadyRunning` if the producer is active.
    /// - `StreamFinished` if this stream was already stopped.
    pub fn start<E: SynthesisEngine>(&self, engine: E) -> Result<()> {
        let mut producer = self.producer.lock();
        match self.status.get() {
            StreamStatus::Idle => {}
            StreamStatus::Stopped | StreamStatus::Error => return Err(ExhaustError::StreamFinished),
            _ => return Err(ExhaustError::AlreadyRunning),
        }

        info!(
            sample_rate = self.config.sample_rate,
            engine_rate = engine.sample_rate(),
            channels = self.config.channels,
            capacity = self.config.capacity,
            prefill = self.config.prefill,
            high = self.config.high_watermark,
            low = self.config.low_watermark,
            "starting stream"
        );
        self.status.set(StreamStatus::Priming, None);

        let ctx = ProducerContext {
            config: self.config.clone(),
            engine,
            coordinator: Arc::clone(&self.coordinator),
            control_rx: self.control_rx.clone(),
            status: Arc::clone(&self.status),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let handle = std::thread::Builder::new()
            .name("exhaust-producer".into())
            .spawn(move || producer::run(ctx))
            .map_err(|e| {
                self.status
                    .set(StreamStatus::Error, Some(format!("spawn failed: {e}")));
                ExhaustError::Io(e)
            })?;
        *producer = Some(handle);
        Ok(())
    }

    /// Request a stop, let the reader drain, and join the producer thread.
    ///
    /// Bounded by the drain timeout plus at most one engine step.
    ///
    /// # Errors
    /// `NotRunning` if the producer was never started or already joined.
    pub fn stop(&self) -> Result<()> {
        let handle = self.producer.lock().take().ok_or(ExhaustError::NotRunning)?;
        info!("stream stop requested");
        self.coordinator.request_stop();
        handle
            .join()
            .map_err(|_| ExhaustError::Other(anyhow::anyhow!("producer thread panicked")))?;
        info!("stream stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.producer.lock().is_some() && self.status.get().is_active()
    }

    /// Claim the ring for the real-time host callback.
    ///
    /// # Errors
    /// `DualConsumer` while an export drain (or another callback) holds it.
    pub fn live_callback(&self) -> Result<ConsumerCallback> {
        let lease = self.coordinator.claim_reader(ReaderMode::Live)?;
        Ok(ConsumerCallback::new(
            lease,
            self.config.channels,
            self.config.sample_rate,
            self.config.callback_lock_budget(),
        ))
    }

    /// Claim the ring for a non-real-time export drain.
    ///
    /// # Errors
    /// `DualConsumer` while a live callback (or another drain) holds it.
    pub fn export_drain(&self) -> Result<ExportDrain> {
        let lease = self.coordinator.claim_reader(ReaderMode::Export)?;
        ExportDrain::new(lease, self.config.channels, self.config.sample_rate, self.config.capacity)
    }

    /// Queue a parameter change for the engine. Applied by the producer
    /// thread at the top of its next iteration.
    ///
    /// # Errors
    /// `NotRunning` before start / after stop, `ControlQueueFull` when the
    /// producer is not keeping up with changes.
    pub fn set_control_parameter(&self, name: &str, value: f64) -> Result<()> {
        if !self.status.get().is_active() {
            return Err(ExhaustError::NotRunning);
        }
        let command = ControlCommand::SetParameter {
            name: name.to_string(),
            value,
        };
        match self.control_tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(name, value, "control queue full");
                Err(ExhaustError::ControlQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(ExhaustError::NotRunning),
        }
    }

    /// Ask the producer to reset the engine to its initial state.
    pub fn reset_engine(&self) -> Result<()> {
        if !self.status.get().is_active() {
            return Err(ExhaustError::NotRunning);
        }
        match self.control_tx.try_send(ControlCommand::Reset) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExhaustError::ControlQueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ExhaustError::NotRunning),
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status.get()
    }

    /// Block until the stream reaches `status` or `timeout` elapses.
    pub fn wait_for_status(&self, status: StreamStatus, timeout: Duration) -> bool {
        self.status.wait_for(status, timeout)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StreamStatusEvent> {
        self.status.tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Samples currently buffered.
    pub fn occupied(&self) -> usize {
        self.coordinator.occupied()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if self.producer.get_mut().is_some() {
            if let Err(e) = self.stop() {
                warn!("stream stop on drop failed: {e}");
            }
        }
    }
}
