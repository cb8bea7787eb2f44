//! Raw sample block handed from a synthesis engine to the producer loop.

/// One production step's worth of mono `i16` samples at a known rate.
///
/// Created by the engine, copied into the ring, then dropped. Never shared
/// with the callback thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub samples: Vec<i16>,
    /// Sample rate in Hz the samples were generated at.
    pub sample_rate: u32,
}

impl SampleBlock {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A block of `len` zero samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_block_is_all_zero() {
        let block = SampleBlock::silence(441, 44_100);
        assert_eq!(block.len(), 441);
        assert!(block.samples.iter().all(|&s| s == 0));
        assert!((block.duration_secs() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn zero_rate_has_zero_duration() {
        assert_eq!(SampleBlock::new(vec![1, 2], 0).duration_secs(), 0.0);
    }
}
