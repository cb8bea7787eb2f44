//! Fixed-capacity circular sample storage.
//!
//! `RingBuffer<T>` is backed by `ringbuf::HeapRb<T>` but is used as a plain
//! single-threaded structure: the producer and consumer halves are never
//! split. Every access goes through the `BufferCoordinator` mutex, which is
//! what makes it safe to share between the producer thread and the host
//! callback.

pub mod block;
pub mod coordinator;

use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};

use crate::error::{ExhaustError, Result};

/// Bounded FIFO of samples. Writes never overtake unread data.
pub struct RingBuffer<T> {
    inner: HeapRb<T>,
}

impl<T: Copy> RingBuffer<T> {
    /// Allocate storage for exactly `capacity` samples.
    ///
    /// # Errors
    /// `ExhaustError::InvalidConfig` when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ExhaustError::InvalidConfig(
                "ring buffer capacity must be non-zero".into(),
            ));
        }
        Ok(Self {
            inner: HeapRb::new(capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity().get()
    }

    /// Append as many of `samples` as fit. Returns the count actually written;
    /// the caller decides whether a short write is acceptable.
    pub fn write(&mut self, samples: &[T]) -> usize {
        self.inner.push_slice(samples)
    }

    /// Remove and return up to `count` samples, oldest first.
    pub fn read(&mut self, count: usize) -> Vec<T> {
        let n = count.min(self.inner.occupied_len());
        let mut out = Vec::with_capacity(n);
        out.extend(self.inner.pop_iter().take(n));
        out
    }

    /// Allocation-free variant of [`read`](Self::read) for the callback path.
    /// Returns how many leading slots of `out` were filled.
    pub fn read_into(&mut self, out: &mut [T]) -> usize {
        self.inner.pop_slice(out)
    }

    pub fn available_to_read(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn available_to_write(&self) -> usize {
        self.inner.vacant_len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop everything buffered. Returns the number of discarded samples.
    pub fn clear(&mut self) -> usize {
        self.inner.clear()
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.inner.capacity())
            .field("occupied", &self.inner.occupied_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn zero_capacity_is_rejected() {
        let err = RingBuffer::<i16>::with_capacity(0).unwrap_err();
        assert!(matches!(err, ExhaustError::InvalidConfig(_)));
    }

    #[test]
    fn write_then_read_preserves_order() {
        let mut rb = RingBuffer::with_capacity(8).unwrap();
        assert_eq!(rb.write(&[1i16, 2, 3, 4, 5]), 5);
        assert_eq!(rb.read(3), vec![1, 2, 3]);
        assert_eq!(rb.available_to_read(), 2);
        assert_eq!(rb.available_to_write(), 6);
    }

    #[test]
    fn short_write_when_capacity_would_be_exceeded() {
        let mut rb = RingBuffer::with_capacity(4).unwrap();
        assert_eq!(rb.write(&[1i16, 2, 3]), 3);
        assert_eq!(rb.write(&[4, 5, 6]), 1);
        assert_eq!(rb.available_to_write(), 0);
        assert_eq!(rb.read(10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn read_from_empty_returns_nothing() {
        let mut rb = RingBuffer::<f32>::with_capacity(4).unwrap();
        assert!(rb.read(3).is_empty());
        let mut out = [9.0f32; 3];
        assert_eq!(rb.read_into(&mut out), 0);
        assert_eq!(out, [9.0; 3]);
    }

    #[test]
    fn wraps_around_the_end_of_storage() {
        let mut rb = RingBuffer::with_capacity(5).unwrap();
        rb.write(&[1i16, 2, 3, 4]);
        assert_eq!(rb.read(3), vec![1, 2, 3]);
        assert_eq!(rb.write(&[5, 6, 7, 8]), 4);
        let mut out = [0i16; 5];
        assert_eq!(rb.read_into(&mut out), 5);
        assert_eq!(out, [4, 5, 6, 7, 8]);
    }

    #[test]
    fn clear_discards_everything() {
        let mut rb = RingBuffer::with_capacity(6).unwrap();
        rb.write(&[1i16, 2, 3]);
        assert_eq!(rb.clear(), 3);
        assert!(rb.is_empty());
        assert_eq!(rb.available_to_write(), 6);
    }

    #[test]
    fn occupancy_stays_within_bounds_for_random_operations() {
        let capacity = 37;
        let mut rb = RingBuffer::with_capacity(capacity).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut next = 0i32;
        let mut expected_next_read = 0i32;

        for _ in 0..5_000 {
            if rng.gen_bool(0.5) {
                let len = rng.gen_range(0..60);
                let block: Vec<i32> = (next..next + len).collect();
                let written = rb.write(&block);
                assert!(written <= len as usize);
                next += written as i32;
            } else {
                let want = rng.gen_range(0..60);
                let got = rb.read(want);
                assert!(got.len() <= want);
                for v in got {
                    assert_eq!(v, expected_next_read);
                    expected_next_read += 1;
                }
            }
            let occupied = rb.available_to_read();
            assert!(occupied <= capacity);
            assert_eq!(occupied + rb.available_to_write(), capacity);
            assert_eq!(occupied as i32, next - expected_next_read);
        }
    }
}
