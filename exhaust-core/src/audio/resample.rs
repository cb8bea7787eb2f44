//! Engine-rate → device-rate conversion with a rubato `FastFixedIn`.
//!
//! Runs on the producer thread only, before samples enter the ring, so the
//! ring always holds device-rate audio and the callback never resamples.
//! When both rates match no rubato session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use super::convert::{sample_to_unit, unit_to_sample};
use crate::error::{ExhaustError, Result};

/// Fixed-ratio mono rate converter.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input carried over between calls until a full chunk is available.
    pending: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`, allocated once.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `chunk_size` is the input frame count per rubato call; the producer
    /// passes its block size so one block normally yields one output block.
    ///
    /// # Errors
    /// `ExhaustError::InvalidConfig` for a zero rate or chunk size, or when
    /// rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || chunk_size == 0 {
            return Err(ExhaustError::InvalidConfig(format!(
                "resampler needs non-zero rates and chunk size (from={from_rate}, to={to_rate}, chunk={chunk_size})"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ExhaustError::InvalidConfig(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        info!(from_rate, to_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Input held back until a full chunk is available.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Resample unit-scale floats. Output may be empty while input is still
    /// accumulating toward a full chunk.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.chunk_size {
            let chunk = &self.pending[offset..offset + self.chunk_size];
            match resampler.process_into_buffer(&[chunk], &mut self.output_buf, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.chunk_size;
        }
        self.pending.drain(..offset);
        out
    }

    /// Resample a raw `i16` block, converting through unit scale.
    pub fn process_block(&mut self, samples: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        let unit: Vec<f32> = samples.iter().copied().map(sample_to_unit).collect();
        self.process(&unit).into_iter().map(unit_to_sample).collect()
    }

    /// Forget carried-over input (stream restart).
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_identity() {
        let mut rc = RateConverter::new(44_100, 44_100, 441).unwrap();
        assert!(rc.is_passthrough());
        let block: Vec<i16> = (0..441).map(|i| i as i16).collect();
        assert_eq!(rc.process_block(&block), block);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 48_000, 441).is_err());
        assert!(RateConverter::new(44_100, 48_000, 0).is_err());
    }

    #[test]
    fn upsampling_44k1_to_48k_has_expected_length() {
        let mut rc = RateConverter::new(44_100, 48_000, 441).unwrap();
        assert!(!rc.is_passthrough());
        let mut total = 0;
        for _ in 0..10 {
            total += rc.process_block(&[0i16; 441]).len();
        }
        // 4410 in at 44.1 kHz ≈ 4800 out at 48 kHz
        assert!((total as isize - 4800).unsigned_abs() <= 48, "total={total}");
    }

    #[test]
    fn partial_input_is_carried_over() {
        let mut rc = RateConverter::new(48_000, 44_100, 480).unwrap();
        assert!(rc.process(&[0.0; 300]).is_empty());
        assert_eq!(rc.pending_len(), 300);
        assert!(!rc.process(&[0.0; 300]).is_empty());
        assert_eq!(rc.pending_len(), 120);
        rc.reset();
        assert_eq!(rc.pending_len(), 0);
        assert!(rc.process(&[0.0; 300]).is_empty());
    }
}
