//! Stream counters shared between the producer thread and the host callback.
//!
//! All updates are `Relaxed` atomics: the callback bumps them without taking
//! any lock and the producer thread logs a snapshot at a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct StreamDiagnostics {
    pub blocks_produced: AtomicU64,
    pub samples_written: AtomicU64,
    pub samples_delivered: AtomicU64,
    pub callbacks: AtomicU64,
    pub underruns: AtomicU64,
    pub underrun_frames: AtomicU64,
    pub lock_misses: AtomicU64,
    pub stall_faults: AtomicU64,
    pub production_faults: AtomicU64,
    pub prime_underfills: AtomicU64,
    pub catch_up_steps: AtomicU64,
    pub dropped_samples: AtomicU64,
    pub peak_occupancy: AtomicU64,
}

impl StreamDiagnostics {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_occupancy(&self, occupied: usize) {
        self.peak_occupancy
            .fetch_max(occupied as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicU64; 13] {
        [
            &self.blocks_produced,
            &self.samples_written,
            &self.samples_delivered,
            &self.callbacks,
            &self.underruns,
            &self.underrun_frames,
            &self.lock_misses,
            &self.stall_faults,
            &self.production_faults,
            &self.prime_underfills,
            &self.catch_up_steps,
            &self.dropped_samples,
            &self.peak_occupancy,
        ]
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_produced: self.blocks_produced.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            callbacks: self.callbacks.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            lock_misses: self.lock_misses.load(Ordering::Relaxed),
            stall_faults: self.stall_faults.load(Ordering::Relaxed),
            production_faults: self.production_faults.load(Ordering::Relaxed),
            prime_underfills: self.prime_underfills.load(Ordering::Relaxed),
            catch_up_steps: self.catch_up_steps.load(Ordering::Relaxed),
            dropped_samples: self.dropped_samples.load(Ordering::Relaxed),
            peak_occupancy: self.peak_occupancy.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StreamDiagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub blocks_produced: u64,
    /// Mono samples accepted into the ring.
    pub samples_written: u64,
    /// Mono samples handed to a reader (excludes flat-extension fill).
    pub samples_delivered: u64,
    pub callbacks: u64,
    pub underruns: u64,
    pub underrun_frames: u64,
    pub lock_misses: u64,
    pub stall_faults: u64,
    pub production_faults: u64,
    pub prime_underfills: u64,
    pub catch_up_steps: u64,
    pub dropped_samples: u64,
    pub peak_occupancy: u64,
}

impl DiagnosticsSnapshot {
    /// True when no glitch of any kind was recorded.
    pub fn is_clean(&self) -> bool {
        self.underruns == 0
            && self.lock_misses == 0
            && self.stall_faults == 0
            && self.production_faults == 0
            && self.dropped_samples == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates_and_reset_clears() {
        let diag = StreamDiagnostics::default();
        StreamDiagnostics::bump(&diag.underruns);
        StreamDiagnostics::add(&diag.underrun_frames, 37);
        diag.record_occupancy(120);
        diag.record_occupancy(80);

        let snap = diag.snapshot();
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.underrun_frames, 37);
        assert_eq!(snap.peak_occupancy, 120);
        assert!(!snap.is_clean());

        diag.reset();
        let snap = diag.snapshot();
        assert_eq!(snap, DiagnosticsSnapshot::default());
        assert!(snap.is_clean());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_string(&DiagnosticsSnapshot::default()).unwrap();
        assert!(json.contains("\"stallFaults\":0"));
        assert!(json.contains("\"peakOccupancy\":0"));
    }
}
