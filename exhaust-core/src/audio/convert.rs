//! Raw engine samples → device samples.
//!
//! The ring holds mono `i16`; devices are fed interleaved `f32` in
//! `[-1.0, 1.0]` with the mono sample duplicated into every channel.
//!
//! Scale is `s / 32767`, so `i16::MAX` maps to exactly `1.0`. `i16::MIN`
//! (`-32768`) would land just below `-1.0` and is clamped. Pure functions
//! only; nothing here allocates except [`convert`].

/// Full-scale divisor for `i16` → unit float.
pub const I16_FULL_SCALE: f32 = 32_767.0;

/// One raw sample to unit scale, clamped to `[-1.0, 1.0]`.
#[inline]
pub fn sample_to_unit(sample: i16) -> f32 {
    (sample as f32 / I16_FULL_SCALE).clamp(-1.0, 1.0)
}

/// Unit-scale float back to a raw sample. Out-of-range and NaN inputs clamp
/// (NaN maps to 0).
#[inline]
pub fn unit_to_sample(value: f32) -> i16 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(-1.0, 1.0) * I16_FULL_SCALE).round() as i16
}

/// Convert a mono block into `channels`-way interleaved floats.
///
/// Empty input (or zero channels) yields empty output.
pub fn convert(raw: &[i16], channels: usize) -> Vec<f32> {
    if channels == 0 {
        return Vec::new();
    }
    let mut out = vec![0.0; raw.len() * channels];
    convert_into(raw, channels, &mut out);
    out
}

/// Allocation-free variant for the callback. Writes whole frames only and
/// returns the number of frames written: `min(raw.len(), out.len() / channels)`.
/// Slots past the last written frame are left untouched.
pub fn convert_into(raw: &[i16], channels: usize, out: &mut [f32]) -> usize {
    if channels == 0 {
        return 0;
    }
    let mut frames = 0;
    for (frame, &sample) in out.chunks_exact_mut(channels).zip(raw) {
        frame.fill(sample_to_unit(sample));
        frames += 1;
    }
    frames
}
