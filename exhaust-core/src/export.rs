//! Export sink: drain a stream into a 32-bit float WAV file.
//!
//! The export path is a reader like the live callback and competes for the
//! same exclusive lease, so a stream is either heard or recorded, never both.
//! It runs on an ordinary thread, may block, and does no underrun filling:
//! whatever the producer wrote is exactly what lands in the file.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::convert::convert_into;
use crate::buffering::coordinator::{ReadOutcome, ReaderLease};
use crate::buffering::RingBuffer;
use crate::engine::diagnostics::{DiagnosticsSnapshot, StreamDiagnostics};
use crate::engine::{AudioStream, StreamConfig};
use crate::error::Result;
use crate::synth::SynthesisEngine;

/// Frames moved per `pull` when the caller does not limit it further.
const PULL_CHUNK_FRAMES: usize = 4096;
/// How long `render_to_wav` waits for data before re-checking stream status.
const READ_WAIT: Duration = Duration::from_millis(250);

/// Export-mode reader. Pulls raw samples, converts them to device format
/// and stages them until a sink takes them.
pub struct ExportDrain {
    lease: ReaderLease,
    channels: usize,
    sample_rate: u32,
    staging: RingBuffer<f32>,
    scratch: Vec<i16>,
    converted: Vec<f32>,
    diagnostics: std::sync::Arc<StreamDiagnostics>,
}

impl ExportDrain {
    pub(crate) fn new(
        lease: ReaderLease,
        channels: u16,
        sample_rate: u32,
        capacity: usize,
    ) -> Result<Self> {
        let channels = usize::from(channels.max(1));
        let diagnostics = std::sync::Arc::clone(lease.coordinator().diagnostics());
        Ok(Self {
            lease,
            channels,
            sample_rate,
            staging: RingBuffer::with_capacity(capacity * channels)?,
            scratch: vec![0; PULL_CHUNK_FRAMES],
            converted: vec![0.0; PULL_CHUNK_FRAMES * channels],
            diagnostics,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn lease(&self) -> &ReaderLease {
        &self.lease
    }

    /// Move up to `max_frames` buffered frames into staging. Never waits for
    /// data. Returns the number of frames moved.
    pub fn pull(&mut self, max_frames: usize) -> usize {
        let room = self.staging.available_to_write() / self.channels;
        let want = max_frames.min(room).min(self.scratch.len());
        if want == 0 {
            return 0;
        }

        let frames = match self.lease.read_into(&mut self.scratch[..want]) {
            ReadOutcome::Delivered { samples, .. } => samples,
            ReadOutcome::Warming | ReadOutcome::LockMissed => 0,
        };
        if frames == 0 {
            return 0;
        }
        StreamDiagnostics::add(&self.diagnostics.samples_delivered, frames);

        let n = convert_into(&self.scratch[..frames], self.channels, &mut self.converted);
        self.staging.write(&self.converted[..n * self.channels]);
        frames
    }

    /// Block until at least `min_frames` are readable or `timeout` passes.
    /// Returns the readable frame count.
    pub fn wait_readable(&self, min_frames: usize, timeout: Duration) -> usize {
        self.lease.wait_readable(min_frames, timeout)
    }

    /// Remove every staged interleaved sample.
    pub fn take_staged(&mut self) -> Vec<f32> {
        let n = self.staging.available_to_read();
        self.staging.read(n)
    }

    pub fn staged_frames(&self) -> usize {
        self.staging.available_to_read() / self.channels
    }
}

/// Writes interleaved `f32` samples as a 32-bit IEEE float WAV.
pub struct WavExporter {
    writer: WavWriter<BufWriter<File>>,
    channels: usize,
    samples_written: u64,
}

impl WavExporter {
    pub fn create(path: impl AsRef<Path>, channels: u16, sample_rate: u32) -> Result<Self> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        debug!(path = %path.as_ref().display(), channels, sample_rate, "wav export opened");
        Ok(Self {
            writer,
            channels: usize::from(channels.max(1)),
            samples_written: 0,
        })
    }

    pub fn write_samples(&mut self, samples: &[f32]) -> Result<()> {
        for &s in samples {
            self.writer.write_sample(s)?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Pop everything staged in `drain` and append it. Returns frames written.
    pub fn write_from(&mut self, drain: &mut ExportDrain) -> Result<usize> {
        let staged = drain.take_staged();
        self.write_samples(&staged)?;
        Ok(staged.len() / self.channels)
    }

    pub fn frames_written(&self) -> u64 {
        self.samples_written / self.channels as u64
    }

    /// Flush the header and close the file. Returns total frames.
    pub fn finalize(self) -> Result<u64> {
        let frames = self.frames_written();
        self.writer.finalize()?;
        Ok(frames)
    }
}

/// Outcome of a headless render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub frames: u64,
    pub seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Render `seconds` of `engine` output to `path` through the export drain.
///
/// The producer runs free (no cadence wait), paced only by how fast the
/// file is written, so rendering is faster than real time.
pub fn render_to_wav<E: SynthesisEngine>(
    mut config: StreamConfig,
    engine: E,
    seconds: f64,
    path: impl AsRef<Path>,
) -> Result<ExportSummary> {
    config.tick_ms = Some(0);
    let target = (seconds.max(0.0) * f64::from(config.sample_rate)).round() as u64;
    let channels = config.channels;
    let sample_rate = config.sample_rate;

    let stream = AudioStream::new(config)?;
    let mut drain = stream.export_drain()?;
    let mut wav = WavExporter::create(path.as_ref(), channels, sample_rate)?;
    info!(path = %path.as_ref().display(), frames = target, "rendering to wav");

    stream.start(engine)?;
    while wav.frames_written() < target {
        if drain.wait_readable(1, READ_WAIT) == 0 && !stream.is_running() {
            warn!(
                written = wav.frames_written(),
                target, "stream ended before export completed"
            );
            break;
        }
        let remaining = (target - wav.frames_written()) as usize;
        drain.pull(remaining);
        wav.write_from(&mut drain)?;
    }

    // Release the reader first so stopping does not wait for a drain nobody
    // is performing.
    drop(drain);
    stream.stop()?;
    let frames = wav.finalize()?;
    info!(frames, "wav export complete");

    Ok(ExportSummary {
        frames,
        seconds: frames as f64 / f64::from(sample_rate),
        sample_rate,
        channels,
        diagnostics: stream.diagnostics_snapshot(),
    })
}
