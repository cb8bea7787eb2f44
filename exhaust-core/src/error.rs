use thiserror::Error;

/// All errors produced by exhaust-core.
#[derive(Debug, Error)]
pub enum ExhaustError {
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("buffer is already drained by the {active} reader; {requested} reader rejected")]
    DualConsumer {
        active: &'static str,
        requested: &'static str,
    },

    #[error("stream is already running")]
    AlreadyRunning,

    #[error("stream is not running")]
    NotRunning,

    #[error("stream has already stopped; build a new stream to restart")]
    StreamFinished,

    #[error("control queue is full; parameter change dropped")]
    ControlQueueFull,

    #[error("synthesis fault: {0}")]
    Production(String),

    #[error("unknown control parameter: {0}")]
    UnknownParameter(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExhaustError {
    /// Whether the stream can keep running after this error.
    ///
    /// Only configuration and ownership violations are fatal; everything the
    /// producer hits at runtime is logged, counted and recovered locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExhaustError::Production(_)
                | ExhaustError::UnknownParameter(_)
                | ExhaustError::ControlQueueFull
        )
    }
}

pub type Result<T> = std::result::Result<T, ExhaustError>;
