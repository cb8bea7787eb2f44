//! Discontinuity detection.

use serde::Serialize;

/// Below this magnitude a sample counts as silent.
pub const SILENCE_THRESHOLD: f32 = 0.001;
/// Jump multiples of the mean absolute delta that are reported.
const JUMP_FACTORS: [f32; 3] = [10.0, 20.0, 50.0];
/// Chunks with RMS under this fraction of the average are dropouts.
const LOW_ENERGY_FRACTION: f32 = 0.2;
/// Below this average RMS the signal is too quiet for dropout detection.
const MIN_AVERAGE_RMS: f32 = 0.01;
/// Exact-zero share (percent) above which the verdict warns.
const MAX_ZERO_PERCENT: f64 = 1.0;
/// Jumps and gaps listed individually in the report.
const MAX_LISTED: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisOptions {
    /// Ignore this much audio at the start (warm-up).
    pub skip_seconds: f64,
    /// Shortest silent run, in seconds, reported as a gap.
    pub min_gap_seconds: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            skip_seconds: 0.0,
            min_gap_seconds: 0.001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Jump {
    pub frame: usize,
    pub delta: f32,
    pub before: f32,
    pub after: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SilentGap {
    pub start_frame: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscontinuityReport {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_analyzed: usize,
    pub mean_delta: f32,
    pub max_delta: f32,
    pub max_delta_frame: usize,
    pub jumps_10x: usize,
    pub jumps_20x: usize,
    pub jumps_50x: usize,
    /// First jumps above 20× the mean delta.
    pub largest_jumps: Vec<Jump>,
    pub first_audio_frame: Option<usize>,
    pub silent_gaps: usize,
    pub silent_gap_frames: usize,
    pub first_gaps: Vec<SilentGap>,
    pub low_energy_chunks: usize,
    pub exact_zero_percent: f64,
    pub peak: f32,
    pub issues: Vec<String>,
}

impl DiscontinuityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Analyze with default options.
pub fn analyze_discontinuities(
    samples: &[f32],
    channels: u16,
    sample_rate: u32,
) -> DiscontinuityReport {
    analyze_discontinuities_with(samples, channels, sample_rate, &AnalysisOptions::default())
}

pub fn analyze_discontinuities_with(
    samples: &[f32],
    channels: u16,
    sample_rate: u32,
    options: &AnalysisOptions,
) -> DiscontinuityReport {
    let ch = usize::from(channels.max(1));
    let skip = (options.skip_seconds.max(0.0) * f64::from(sample_rate)) as usize;
    let first: Vec<f32> = samples.iter().step_by(ch).skip(skip).copied().collect();

    let mut report = DiscontinuityReport {
        sample_rate,
        channels,
        frames_analyzed: first.len(),
        mean_delta: 0.0,
        max_delta: 0.0,
        max_delta_frame: 0,
        jumps_10x: 0,
        jumps_20x: 0,
        jumps_50x: 0,
        largest_jumps: Vec::new(),
        first_audio_frame: None,
        silent_gaps: 0,
        silent_gap_frames: 0,
        first_gaps: Vec::new(),
        low_energy_chunks: 0,
        exact_zero_percent: 0.0,
        peak: 0.0,
        issues: Vec::new(),
    };
    if first.len() < 2 {
        report.issues.push("not enough samples to analyze".into());
        return report;
    }

    scan_jumps(&first, skip, &mut report);

    let Some(audio_start) = first.iter().position(|s| s.abs() > SILENCE_THRESHOLD) else {
        report.issues.push("no audio above the silence threshold".into());
        return report;
    };
    report.first_audio_frame = Some(audio_start + skip);
    let audible = &first[audio_start..];

    let min_gap = ((options.min_gap_seconds * f64::from(sample_rate)) as usize).max(1);
    scan_gaps(audible, audio_start + skip, min_gap, &mut report);

    report.low_energy_chunks = count_low_energy_chunks(audible, (sample_rate / 60).max(1) as usize);

    let zeros = audible.iter().filter(|&&s| s == 0.0).count();
    report.exact_zero_percent = zeros as f64 * 100.0 / audible.len() as f64;
    report.peak = audible.iter().fold(0.0f32, |m, s| m.max(s.abs()));

    if report.jumps_20x > 0 {
        report.issues.push(format!(
            "{} amplitude discontinuities above 20x the mean delta",
            report.jumps_20x
        ));
    }
    if report.silent_gaps > 0 {
        report.issues.push(format!(
            "{} silent gaps ({} frames)",
            report.silent_gaps, report.silent_gap_frames
        ));
    }
    if report.exact_zero_percent > MAX_ZERO_PERCENT {
        report.issues.push(format!(
            "{:.1}% exact zeros after first audio",
            report.exact_zero_percent
        ));
    }
    if report.low_energy_chunks > 0 {
        report
            .issues
            .push(format!("{} low-energy chunks", report.low_energy_chunks));
    }
    report
}

fn scan_jumps(first: &[f32], offset: usize, report: &mut DiscontinuityReport) {
    let deltas: Vec<f32> = first.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let mean = deltas.iter().sum::<f32>() / deltas.len() as f32;
    report.mean_delta = mean;

    let [t10, t20, t50] = JUMP_FACTORS.map(|f| mean * f);
    for (i, &d) in deltas.iter().enumerate() {
        if d > report.max_delta {
            report.max_delta = d;
            report.max_delta_frame = i + 1 + offset;
        }
        if d > t10 {
            report.jumps_10x += 1;
        }
        if d > t20 {
            report.jumps_20x += 1;
            if report.largest_jumps.len() < MAX_LISTED {
                report.largest_jumps.push(Jump {
                    frame: i + 1 + offset,
                    delta: d,
                    before: first[i],
                    after: first[i + 1],
                });
            }
        }
        if d > t50 {
            report.jumps_50x += 1;
        }
    }
}

/// Silent runs that are followed by audio again. Trailing silence is not a gap.
fn scan_gaps(audible: &[f32], offset: usize, min_gap: usize, report: &mut DiscontinuityReport) {
    let mut run_start: Option<usize> = None;
    for (i, s) in audible.iter().enumerate() {
        let silent = s.abs() < SILENCE_THRESHOLD;
        match (silent, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                let frames = i - start;
                if frames >= min_gap {
                    report.silent_gaps += 1;
                    report.silent_gap_frames += frames;
                    if report.first_gaps.len() < MAX_LISTED {
                        report.first_gaps.push(SilentGap {
                            start_frame: start + offset,
                            frames,
                        });
                    }
                }
                run_start = None;
            }
            _ => {}
        }
    }
}

fn count_low_energy_chunks(audible: &[f32], chunk: usize) -> usize {
    let rms: Vec<f32> = audible
        .chunks_exact(chunk)
        .map(|c| (c.iter().map(|s| s * s).sum::<f32>() / c.len() as f32).sqrt())
        .collect();
    if rms.is_empty() {
        return 0;
    }
    let avg = rms.iter().sum::<f32>() / rms.len() as f32;
    if avg <= MIN_AVERAGE_RMS {
        return 0;
    }
    rms.iter().filter(|&&r| r < avg * LOW_ENERGY_FRACTION).count()
}
