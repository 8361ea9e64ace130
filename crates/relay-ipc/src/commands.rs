//! Commands sent from the caller to the engine.

use serde::{Deserialize, Serialize};

use crate::types::StreamConfig;

/// Commands that the owning session can send to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start a capture session with the given configuration.
    Start { config: StreamConfig },

    /// Stop the current capture session.
    Stop,

    /// The transport layer reports that the remote session has ended.
    TransportClosed,

    /// Request current engine state.
    GetState,

    /// Shutdown the engine completely.
    Shutdown,
}
