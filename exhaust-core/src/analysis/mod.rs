//! Offline glitch analysis of rendered or captured audio.
//!
//! `analyze_discontinuities` looks for the audible symptoms of a pipeline
//! fault in the first channel of an interleaved buffer:
//! - sample-to-sample jumps far above the signal's mean slope (clicks);
//! - silent gaps after audio has started (underrun filled with zeros);
//! - 1/60 s chunks whose energy collapses relative to the average (dropouts);
//! - an excess of exact-zero samples.

pub mod crackle;

pub use crackle::{
    analyze_discontinuities, analyze_discontinuities_with, AnalysisOptions, DiscontinuityReport,
    Jump, SilentGap,
};

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec};

use crate::error::{ExhaustError, Result};

/// Load any PCM or float WAV as interleaved unit-scale `f32`.
///
/// Integer formats are scaled by their full-scale value (`2^(bits-1)`).
pub fn read_wav_f32(path: impl AsRef<Path>) -> Result<(Vec<f32>, WavSpec)> {
    let mut reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(ExhaustError::UnsupportedFormat(format!(
                    "{}-bit integer WAV",
                    spec.bits_per_sample
                )));
            }
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok((samples, spec))
}
