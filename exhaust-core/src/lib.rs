//! # exhaust-core
//!
//! Real-time audio streaming SDK: one producer thread, one reader, a bounded
//! buffer between them that never lets the device go hungry.
//!
//! ## Architecture
//!
//! ```text
//! SynthesisEngine::step ─→ RateConverter ─→ BufferCoordinator (i16 ring)
//!     (producer thread)                          │        │
//!                                       ReaderLease::Live  ReaderLease::Export
//!                                                │        │
//!                               ConsumerCallback::render  ExportDrain::pull
//!                                                │        │
//!                                          cpal output   WAV file
//! ```
//!
//! The producer fills up to the high watermark and sleeps on a condition
//! variable when the buffer is full. Exactly one reader may be attached at a
//! time. The live callback bounds its lock wait and holds the last sample
//! flat on shortfall instead of emitting zeros.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod analysis;
pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod synth;

// Convenience re-exports for downstream crates
pub use analysis::{analyze_discontinuities, read_wav_f32, DiscontinuityReport};
pub use audio::{list_output_devices, probe_output, AudioOutput, DeviceInfo};
pub use buffering::coordinator::ReaderMode;
pub use engine::consumer::ConsumerCallback;
pub use engine::diagnostics::DiagnosticsSnapshot;
pub use engine::{AudioStream, StreamConfig};
pub use error::{ExhaustError, Result};
pub use events::{StreamStatus, StreamStatusEvent};
pub use export::{render_to_wav, ExportDrain, ExportSummary, WavExporter};
pub use synth::{jitter::JitterProfile, JitterEngine, SineEngine, SynthesisEngine};
