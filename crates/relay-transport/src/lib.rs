//! Sample delivery.
//!
//! This crate defines the [`SampleSink`] consumer interface, a channel-backed
//! sink, and the [`SampleEmitter`] that forwards demuxed frames to a sink.

mod emitter;
mod error;
mod sink;

pub use emitter::{EmitterStats, SampleEmitter};
pub use error::TransportError;
pub use sink::{ChannelSink, Sample, SampleSink};

/// Channel capacity for outgoing samples.
pub const SAMPLE_CHANNEL_CAPACITY: usize = 30;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
