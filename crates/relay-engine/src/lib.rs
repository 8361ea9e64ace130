//! Capture pipeline and engine for screenrelay.
//!
//! A [`CaptureSession`] wires the encoder subprocess, the demuxer and the
//! sample emitter under one cancellation token. The [`Engine`] drives
//! sessions from [`EngineCommand`]s and reports back through
//! [`EngineEvent`]s.

mod error;
mod metrics;
mod orchestrator;
mod session;

pub use error::EngineError;
pub use metrics::MetricsCollector;
pub use orchestrator::{CommandBuilder, Engine, SinkFactory};
pub use session::{CaptureSession, SessionOutcome};

use crossbeam_channel::{Receiver, Sender};
use relay_ipc::{EngineCommand, EngineEvent};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Create an engine instance with IPC channels.
pub fn create_engine(
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    sink_factory: SinkFactory,
) -> EngineResult<Engine> {
    Engine::new(command_rx, event_tx, sink_factory)
}
