//! Typed caller<->engine messages for screenrelay.
//!
//! This crate defines the configuration, state and message types shared
//! between the owning session (CLI, signaling layer) and the engine core.

mod commands;
mod events;
mod state;
mod types;

pub use commands::EngineCommand;
pub use events::EngineEvent;
pub use state::{EngineState, StopReason};
pub use types::{
    CaptureRegion, ConfigError, OutputFraming, StreamConfig, StreamMetrics, StreamSettings,
    WarningType, DEFAULT_FPS_REPORT_INTERVAL, DEFAULT_MAX_FRAME_SIZE,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (caller → Engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (Engine → caller).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
