//! Events sent from the engine to the caller.

use serde::{Deserialize, Serialize};

use crate::state::{EngineState, StopReason};
use crate::types::{StreamMetrics, WarningType};

/// Events that the engine can send to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Engine state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<EngineState>,

        /// Current state.
        current: Box<EngineState>,
    },

    /// Updated session metrics.
    Metrics(StreamMetrics),

    /// Performance warning detected.
    PerformanceWarning(WarningType),

    /// A capture session finished.
    SessionEnded {
        /// Why the session ended.
        reason: StopReason,

        /// Frames delivered to the sink during the session.
        frames_sent: u64,
    },

    /// Error occurred.
    Error {
        /// Whether the error is recoverable.
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// Engine is ready.
    Ready,

    /// Engine has shut down.
    Shutdown,
}
