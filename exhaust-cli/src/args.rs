//! CLI argument parsing using clap

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// exhaust - real-time audio streaming harness
///
/// Streams a synthesis engine to an output device, a WAV file, or a
/// simulated host, and reports underruns and stalls.
#[derive(Parser, Debug)]
#[command(name = "exhaust")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Settings file (defaults to the user data directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Step-latency simulation flags shared by `play` and `soak`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct JitterArgs {
    /// Fixed cost added to every engine step
    #[arg(long)]
    pub jitter_ms: Option<u64>,

    /// Extra cost of a latency spike
    #[arg(long)]
    pub spike_ms: Option<u64>,

    /// Probability that a step spikes (0-1)
    #[arg(long)]
    pub spike_chance: Option<f64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream the sine engine to an output device
    Play {
        /// Stop after this many seconds (runs until Ctrl+C if omitted)
        #[arg(short, long)]
        seconds: Option<f64>,

        /// Tone frequency in Hz
        #[arg(short, long)]
        frequency: Option<f64>,

        /// Sweep the frequency linearly to this value over the run
        #[arg(long, requires = "seconds")]
        sweep_to: Option<f64>,

        /// Tone amplitude (0-1)
        #[arg(short, long)]
        amplitude: Option<f64>,

        #[command(flatten)]
        jitter: JitterArgs,

        /// Output device name (exact match)
        #[arg(short, long)]
        device: Option<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render the sine engine to a 32-bit float WAV file
    Export {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, default_value = "5")]
        seconds: f64,

        #[arg(short, long)]
        frequency: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Drive the stream from a simulated host clock and report glitches
    Soak {
        /// Number of host callbacks to simulate
        #[arg(short, long, default_value = "1000")]
        iterations: usize,

        #[command(flatten)]
        jitter: JitterArgs,

        #[arg(long)]
        json: bool,
    },

    /// Report clicks, gaps and dropouts in a WAV file
    Analyze {
        file: PathBuf,

        /// Ignore this many seconds at the start
        #[arg(long, default_value = "0")]
        skip: f64,

        #[arg(long)]
        json: bool,
    },

    /// List output devices
    Devices {
        #[arg(long)]
        json: bool,
    },

    /// Print the effective settings
    Config {
        /// Persist the effective settings to the settings file
        #[arg(long)]
        write: bool,
    },
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}
