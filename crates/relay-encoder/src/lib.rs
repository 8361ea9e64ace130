//! Encoder subprocess management.
//!
//! This crate builds the encoder command line from a [`relay_ipc::StreamConfig`]
//! and supervises the resulting process: stdout is the data path, stderr is
//! logged, and the process is killed when its session is cancelled.

mod command;
mod error;
mod supervisor;

pub use command::EncoderCommand;
pub use error::EncoderError;
pub use supervisor::{ProcessSupervisor, TerminationOutcome, DEFAULT_WAIT_TIMEOUT};

/// Result type for encoder operations.
pub type EncoderResult<T> = Result<T, EncoderError>;
