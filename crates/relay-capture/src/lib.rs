//! Encoder output demuxing.
//!
//! This crate turns the byte stream an encoder writes to its stdout into
//! discrete [`Frame`]s. Two framings are supported: IVF containers (VP8) and
//! raw H.264 Annex B elementary streams. Reads go through a tiered
//! [`BufferPool`] so steady-state demuxing does not allocate per frame.

mod annexb;
mod error;
mod frame;
mod ivf;
pub mod nal;
mod pool;

pub use annexb::{AccessUnit, AnnexBDemuxer, AnnexBReader, Reframer};
pub use error::CaptureError;
pub use frame::Frame;
pub use ivf::{
    DemuxConfig, FrameHeader, IvfDemuxer, IvfHeader, IVF_FRAME_HEADER_SIZE, IVF_HEADER_SIZE,
    IVF_SIGNATURE,
};
pub use pool::{
    BufferPool, FixedBuffer, FixedPool, FrameHeaderPool, HeaderPool, PoolStats, PoolTier,
    PooledBuffer, TierStats, DEFAULT_MAX_RETAINED,
};

use std::future::Future;

/// Largest frame payload accepted by default (10 MiB).
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Trait for demuxed frame sources.
pub trait FrameSource: Send {
    /// Read the next frame.
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly. After an error
    /// the source is finished and keeps returning `Ok(None)`.
    fn next_frame(&mut self) -> impl Future<Output = CaptureResult<Option<Frame>>> + Send;
}
