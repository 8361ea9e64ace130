//! Error types for the encoder module.

use std::io;

use thiserror::Error;

/// Errors that can occur while starting the encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder process could not be started or its pipes attached.
    #[error("Failed to launch encoder {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
}
