//! exhaust - command line host for the exhaust streaming core

mod args;
mod settings;
mod soak;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use exhaust_core::analysis::{analyze_discontinuities_with, AnalysisOptions};
use exhaust_core::{
    list_output_devices, probe_output, read_wav_f32, render_to_wav, AudioOutput, AudioStream,
    DiagnosticsSnapshot, JitterEngine, JitterProfile, SineEngine, SynthesisEngine,
};

use args::{Args, Command, JitterArgs};
use settings::{default_settings_path, load_settings, save_settings, HostSettings};

/// How often `play` checks for Ctrl+C, device failure and sweep updates.
const PLAY_POLL: Duration = Duration::from_millis(50);

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level().to_string().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("exhaust={level},exhaust_core={level}")));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &args.log {
        let file = std::fs::File::create(log_file)
            .with_context(|| format!("creating log file {}", log_file.display()))?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else {
        subscriber.init();
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let settings_path = args.config.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(settings_path = %settings_path.display(), "settings loaded");

    match args.command {
        Command::Play {
            seconds,
            frequency,
            sweep_to,
            amplitude,
            jitter,
            device,
            json,
        } => {
            let mut settings = settings;
            if let Some(f) = frequency {
                settings.frequency = f;
            }
            if let Some(a) = amplitude {
                settings.amplitude = a;
            }
            if device.is_some() {
                settings.preferred_output_device = device;
            }
            apply_jitter_args(&mut settings, &jitter);
            settings.normalize();
            cmd_play(&settings, seconds, sweep_to, json)
        }
        Command::Export {
            output,
            seconds,
            frequency,
            json,
        } => {
            let mut settings = settings;
            if let Some(f) = frequency {
                settings.frequency = f;
            }
            settings.normalize();
            cmd_export(&settings, &output, seconds, json)
        }
        Command::Soak {
            iterations,
            jitter,
            json,
        } => {
            let mut settings = settings;
            apply_jitter_args(&mut settings, &jitter);
            settings.normalize();
            cmd_soak(&settings, iterations, json)
        }
        Command::Analyze { file, skip, json } => cmd_analyze(&file, skip, json),
        Command::Devices { json } => cmd_devices(json),
        Command::Config { write } => cmd_config(&settings, &settings_path, write),
    }
}

fn apply_jitter_args(settings: &mut HostSettings, jitter: &JitterArgs) {
    if let Some(ms) = jitter.jitter_ms {
        settings.jitter.base_ms = ms;
    }
    if let Some(ms) = jitter.spike_ms {
        settings.jitter.spike_ms = ms;
        // A spike size alone means "spike sometimes".
        if jitter.spike_chance.is_none() && settings.jitter.spike_chance == 0.0 {
            settings.jitter.spike_chance = 0.05;
        }
    }
    if let Some(p) = jitter.spike_chance {
        settings.jitter.spike_chance = p;
    }
}

fn build_engine(settings: &HostSettings) -> Box<dyn SynthesisEngine> {
    let sine = SineEngine::new(
        settings.engine_sample_rate,
        settings.frequency,
        settings.amplitude,
    );
    if !settings.jitter.is_enabled() {
        return Box::new(sine);
    }
    let profile = JitterProfile {
        base_cost: Duration::from_millis(settings.jitter.base_ms),
        spike: Duration::from_millis(settings.jitter.spike_ms),
        spike_chance: settings.jitter.spike_chance,
    };
    info!(
        base_ms = settings.jitter.base_ms,
        spike_ms = settings.jitter.spike_ms,
        spike_chance = settings.jitter.spike_chance,
        "step jitter enabled"
    );
    Box::new(JitterEngine::new(sine, profile))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_diagnostics(d: &DiagnosticsSnapshot) {
    println!("  blocks produced:   {}", d.blocks_produced);
    println!("  samples written:   {}", d.samples_written);
    println!("  samples delivered: {}", d.samples_delivered);
    println!("  callbacks:         {}", d.callbacks);
    println!(
        "  underruns:         {} ({} frames)",
        d.underruns, d.underrun_frames
    );
    println!("  lock misses:       {}", d.lock_misses);
    println!("  stall faults:      {}", d.stall_faults);
    println!("  production faults: {}", d.production_faults);
    println!("  prime underfills:  {}", d.prime_underfills);
    println!("  catch-up steps:    {}", d.catch_up_steps);
    println!("  dropped samples:   {}", d.dropped_samples);
    println!("  peak occupancy:    {}", d.peak_occupancy);
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayReport {
    device: String,
    sample_rate: u32,
    channels: u16,
    seconds: f64,
    output_failed: bool,
    diagnostics: DiagnosticsSnapshot,
}

/// Stream the engine to the output device until the duration elapses,
/// Ctrl+C is pressed, or the device fails.
fn cmd_play(
    settings: &HostSettings,
    seconds: Option<f64>,
    sweep_to: Option<f64>,
    json: bool,
) -> Result<()> {
    let preferred = settings.preferred_output_device.as_deref();
    let device = probe_output(preferred).context("probing output device")?;

    // Block size and watermarks are configured in samples at the configured
    // rate; keep their durations when the device runs at another rate.
    let mut config = match device.sample_rate {
        Some(rate) => settings.stream.rescaled_to(rate),
        None => settings.stream.clone(),
    };
    if let Some(channels) = device.channels {
        config.channels = channels;
    }
    info!(
        device = device.name.as_str(),
        device_rate = config.sample_rate,
        engine_rate = settings.engine_sample_rate,
        channels = config.channels,
        block_frames = config.block_frames,
        tick_us = config.tick().as_micros() as u64,
        "output device selected"
    );

    let stream = AudioStream::new(config)?;
    let output = AudioOutput::open(stream.live_callback()?, preferred)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let r = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("\nReceived Ctrl+C, stopping...");
            r.store(false, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {e}");
        }
    }

    stream.start(build_engine(settings))?;
    if !json {
        println!(
            "Playing {:.1} Hz on '{}' ({} Hz, {} ch). Press Ctrl+C to stop.",
            settings.frequency,
            output.device_name(),
            output.sample_rate(),
            output.channels()
        );
    }

    let started = Instant::now();
    let start_frequency = settings.frequency;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(PLAY_POLL);
        let elapsed = started.elapsed().as_secs_f64();

        if output.has_failed() {
            warn!("output stream failed; stopping");
            break;
        }
        if !stream.is_running() {
            warn!(status = ?stream.status(), "producer is no longer running");
            break;
        }
        if let (Some(total), Some(target)) = (seconds, sweep_to) {
            let progress = (elapsed / total).clamp(0.0, 1.0);
            let frequency = start_frequency + (target - start_frequency) * progress;
            if let Err(e) = stream.set_control_parameter("frequency", frequency) {
                if !e.is_recoverable() {
                    return Err(e.into());
                }
                debug!("sweep step skipped: {e}");
            }
        }
        if seconds.is_some_and(|total| elapsed >= total) {
            break;
        }
    }

    let played = started.elapsed().as_secs_f64();
    // The device keeps pulling while the producer drains.
    stream.stop()?;
    let output_failed = output.has_failed();
    let device_name = output.device_name().to_string();
    drop(output);

    let report = PlayReport {
        device: device_name,
        sample_rate: stream.config().sample_rate,
        channels: stream.config().channels,
        seconds: played,
        output_failed,
        diagnostics: stream.diagnostics_snapshot(),
    };
    if json {
        return print_json(&report);
    }
    println!("\nPlayed {:.2} s on '{}'", report.seconds, report.device);
    print_diagnostics(&report.diagnostics);
    Ok(())
}

fn cmd_export(settings: &HostSettings, output: &Path, seconds: f64, json: bool) -> Result<()> {
    let summary = render_to_wav(
        settings.stream.clone(),
        build_engine(settings),
        seconds,
        output,
    )
    .with_context(|| format!("rendering to {}", output.display()))?;

    if json {
        return print_json(&summary);
    }
    println!(
        "Wrote {} frames ({:.2} s, {} Hz, {} ch) to {}",
        summary.frames,
        summary.seconds,
        summary.sample_rate,
        summary.channels,
        output.display()
    );
    print_diagnostics(&summary.diagnostics);
    Ok(())
}

fn cmd_soak(settings: &HostSettings, iterations: usize, json: bool) -> Result<()> {
    let stream = AudioStream::new(settings.stream.clone())?;
    let report = soak::run(&stream, build_engine(settings), iterations)?;

    if json {
        return print_json(&report);
    }
    println!(
        "Soak: {} callbacks of {} frames in {:.2} s",
        report.iterations, report.frames_per_callback, report.wall_seconds
    );
    println!(
        "  callback time:     p50 {:.1} us, p99 {:.1} us, max {:.1} us",
        report.callback_p50_us, report.callback_p99_us, report.callback_max_us
    );
    println!("  short callbacks:   {}", report.short_callbacks);
    print_diagnostics(&report.diagnostics);
    println!(
        "\n{}",
        if report.is_clean() {
            "CLEAN: no underruns or stalls"
        } else {
            "GLITCHES DETECTED"
        }
    );
    Ok(())
}

fn cmd_analyze(file: &Path, skip: f64, json: bool) -> Result<()> {
    let (samples, spec) =
        read_wav_f32(file).with_context(|| format!("reading {}", file.display()))?;
    let options = AnalysisOptions {
        skip_seconds: skip,
        ..AnalysisOptions::default()
    };
    let report = analyze_discontinuities_with(&samples, spec.channels, spec.sample_rate, &options);

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{}: {} frames, {} Hz, {} ch",
            file.display(),
            report.frames_analyzed,
            report.sample_rate,
            report.channels
        );
        println!(
            "  mean delta {:.6}, max delta {:.6} at frame {}",
            report.mean_delta, report.max_delta, report.max_delta_frame
        );
        println!(
            "  jumps: >10x {}, >20x {}, >50x {}",
            report.jumps_10x, report.jumps_20x, report.jumps_50x
        );
        for jump in report.largest_jumps.iter().take(10) {
            println!(
                "    frame {:>9}: {:+.4} -> {:+.4} (delta {:.4})",
                jump.frame, jump.before, jump.after, jump.delta
            );
        }
        println!(
            "  silent gaps: {} ({} frames), low-energy chunks: {}, exact zeros: {:.2}%",
            report.silent_gaps,
            report.silent_gap_frames,
            report.low_energy_chunks,
            report.exact_zero_percent
        );
        if report.is_clean() {
            println!("\nCLEAN");
        } else {
            println!("\nISSUES:");
            for issue in &report.issues {
                println!("  - {issue}");
            }
        }
    }

    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_devices(json: bool) -> Result<()> {
    let devices = list_output_devices();
    if json {
        return print_json(&devices);
    }
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }
    println!("Output devices:\n");
    for (i, device) in devices.iter().enumerate() {
        let default_tag = if device.is_default { " (default)" } else { "" };
        let format = match (device.sample_rate, device.channels) {
            (Some(rate), Some(ch)) => format!(" [{rate} Hz, {ch} ch]"),
            _ => String::new(),
        };
        println!("  {}. {}{}{}", i + 1, device.name, default_tag, format);
    }
    println!();
    Ok(())
}

fn cmd_config(settings: &HostSettings, path: &Path, write: bool) -> Result<()> {
    settings.stream.validate()?;
    print_json(settings)?;
    if write {
        save_settings(path, settings)
            .with_context(|| format!("writing settings to {}", path.display()))?;
        eprintln!("Settings written to {}", path.display());
    }
    Ok(())
}
