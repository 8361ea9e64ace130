//! Engine state machine types.

use serde::{Deserialize, Serialize};

use crate::types::{StreamConfig, StreamMetrics};

/// The current state of the relay engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// Engine is idle, no capture session.
    #[default]
    Idle,

    /// Encoder is being launched.
    Starting,

    /// Frames are flowing to the sink.
    Live {
        /// Active session configuration.
        config: StreamConfig,

        /// Latest session metrics.
        metrics: StreamMetrics,
    },

    /// Session teardown in progress.
    Stopping {
        /// Reason for stopping.
        reason: StopReason,
    },

    /// The last session could not start or failed.
    Error {
        /// Error message.
        message: String,

        /// Whether a new `Start` is expected to succeed.
        recoverable: bool,
    },
}

impl EngineState {
    /// Returns true if the engine is in the Idle state.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the engine is currently live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Returns true if the engine is starting.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting)
    }

    /// Returns true if the engine is stopping.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// Returns true if the engine is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Live { .. } => "Live",
            Self::Stopping { .. } => "Stopping",
            Self::Error { .. } => "Error",
        }
    }
}

/// Why a capture session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Caller requested stop.
    UserRequested,

    /// The transport reported that the remote session is gone.
    TransportClosed,

    /// The encoder closed its output cleanly.
    StreamEnded,

    /// The byte stream could not be framed; it is no longer trustworthy.
    FramingError { message: String },

    /// The encoder process exited with a failure status.
    EncoderExited { message: String },

    /// The capture task itself failed.
    TaskFailed { message: String },

    /// The engine is shutting down.
    Shutdown,
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Capture stopped by user".to_string(),
            Self::TransportClosed => "Transport session closed".to_string(),
            Self::StreamEnded => "Encoder stream ended".to_string(),
            Self::FramingError { message } => format!("Framing error: {message}"),
            Self::EncoderExited { message } => format!("Encoder exited: {message}"),
            Self::TaskFailed { message } => format!("Capture task failed: {message}"),
            Self::Shutdown => "Engine shutting down".to_string(),
        }
    }

    /// Returns true if the session ended because something went wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FramingError { .. } | Self::EncoderExited { .. } | Self::TaskFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(EngineState::Idle.name(), "Idle");
        assert_eq!(EngineState::Starting.name(), "Starting");
        assert!(EngineState::default().is_idle());
    }

    #[test]
    fn test_stop_reason_failure() {
        assert!(!StopReason::StreamEnded.is_failure());
        assert!(!StopReason::UserRequested.is_failure());
        assert!(StopReason::FramingError {
            message: "bad size".into()
        }
        .is_failure());
    }
}
