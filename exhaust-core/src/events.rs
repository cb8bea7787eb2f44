//! Status events published by a running stream.
//!
//! Delivered over a `tokio::sync::broadcast` channel; no async runtime is
//! needed to send or to `try_recv`. Slow subscribers lag rather than block
//! the producer.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a stream's producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Created; no producer thread running.
    Idle,
    /// Filling the ring to the prefill target before readers see data.
    Priming,
    Streaming,
    /// Stop requested; readers are emptying what is left.
    Draining,
    /// Producer thread exited and the ring was discarded.
    Stopped,
    /// Startup failed; the stream must be rebuilt.
    Error,
}

impl StreamStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamStatus::Priming | StreamStatus::Streaming | StreamStatus::Draining
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusEvent {
    pub status: StreamStatus,
    /// Optional human-readable detail (underfill size, error message).
    pub detail: Option<String>,
}
