//! Error types for the engine.

use relay_encoder::EncoderError;
use relay_ipc::ConfigError;
use thiserror::Error;

/// Errors that can occur while starting a capture session.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The stream configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The encoder could not be launched.
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// The async runtime could not be created.
    #[error("Failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
