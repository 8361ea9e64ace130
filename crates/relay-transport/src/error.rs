//! Error types for the transport module.

use thiserror::Error;

/// Errors a sample sink can report.
///
/// None of these end a session; the emitter logs and counts them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The sink cannot take more samples right now.
    #[error("Sink is full, sample dropped")]
    Backpressure,

    /// The receiving side of a channel sink is gone.
    #[error("Channel disconnected")]
    ChannelDisconnected,

    /// The sink refused the sample.
    #[error("Sample rejected: {0}")]
    Rejected(String),

    /// The sink has been closed.
    #[error("Sink closed")]
    Closed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
