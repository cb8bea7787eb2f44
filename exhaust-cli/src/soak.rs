//! Headless host simulation: a device thread that calls the consumer callback
//! on a fixed clock, timing every call.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use exhaust_core::{AudioStream, DiagnosticsSnapshot, StreamStatus, SynthesisEngine};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoakReport {
    pub iterations: usize,
    pub frames_per_callback: usize,
    /// Calls that returned a frame count other than requested. Always 0 unless
    /// the callback contract is broken.
    pub short_callbacks: usize,
    pub callback_p50_us: f64,
    pub callback_p99_us: f64,
    pub callback_max_us: f64,
    pub wall_seconds: f64,
    pub diagnostics: DiagnosticsSnapshot,
}

impl SoakReport {
    pub fn is_clean(&self) -> bool {
        self.short_callbacks == 0
            && self.diagnostics.underruns == 0
            && self.diagnostics.stall_faults == 0
    }
}

pub fn run<E: SynthesisEngine>(
    stream: &AudioStream,
    engine: E,
    iterations: usize,
) -> Result<SoakReport> {
    let config = stream.config().clone();
    let frames = config.callback_frames;
    let period = Duration::from_secs_f64(frames as f64 / f64::from(config.sample_rate));
    let mut callback = stream.live_callback().context("claiming live reader")?;

    stream.start(engine)?;
    if !stream.wait_for_status(StreamStatus::Streaming, Duration::from_secs(5)) {
        warn!(
            status = ?stream.status(),
            "stream did not reach streaming before the soak began"
        );
    }
    info!(iterations, frames, period_us = period.as_micros() as u64, "soak started");

    let host = thread::Builder::new()
        .name("exhaust-soak-host".into())
        .spawn(move || {
            let mut out = vec![0.0f32; frames * usize::from(callback.channels())];
            let mut timings = Vec::with_capacity(iterations);
            let mut short = 0usize;
            let mut next = Instant::now();
            for _ in 0..iterations {
                let started = Instant::now();
                if callback.render(&mut out) != frames {
                    short += 1;
                }
                timings.push(started.elapsed().as_secs_f64() * 1e6);
                next += period;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            (timings, short)
        })
        .context("spawning soak host thread")?;

    let wall = Instant::now();
    let (timings, short_callbacks) = host
        .join()
        .map_err(|_| anyhow::anyhow!("soak host thread panicked"))?;
    let wall_seconds = wall.elapsed().as_secs_f64();
    stream.stop()?;

    Ok(SoakReport {
        iterations,
        frames_per_callback: frames,
        short_callbacks,
        callback_p50_us: percentile(&timings, 0.50),
        callback_p99_us: percentile(&timings, 0.99),
        callback_max_us: timings.iter().copied().fold(0.0, f64::max),
        wall_seconds,
        diagnostics: stream.diagnostics_snapshot(),
    })
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use exhaust_core::{SineEngine, StreamConfig};

    #[test]
    fn percentile_picks_nearest_rank() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 0.5), 3.0);
        assert_eq!(percentile(&values, 1.0), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn short_soak_renders_every_callback() {
        let stream = AudioStream::new(StreamConfig::default()).unwrap();
        let report = run(&stream, SineEngine::default(), 50).unwrap();
        assert_eq!(report.iterations, 50);
        assert_eq!(report.short_callbacks, 0);
        assert_eq!(report.diagnostics.callbacks, 50);
        assert_eq!(stream.status(), StreamStatus::Stopped);
    }
}
