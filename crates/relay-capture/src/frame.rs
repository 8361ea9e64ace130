//! Demuxed frame types.

use std::time::Duration;

use bytes::Bytes;

/// A complete encoded frame ready for the sink.
///
/// The payload never aliases a pooled buffer: the sink may keep it after
/// the write returns.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded frame data.
    pub payload: Bytes,

    /// Nominal display duration.
    pub duration: Duration,

    /// Container timestamp, when the framing carries one.
    pub pts: Option<u64>,

    /// Position of this frame in the session, starting at zero.
    pub sequence: u64,

    /// Whether the frame can be decoded without earlier frames.
    pub is_keyframe: bool,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: Bytes, duration: Duration, sequence: u64) -> Self {
        Self {
            payload,
            duration,
            pts: None,
            sequence,
            is_keyframe: false,
        }
    }

    /// Attach a container timestamp.
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Mark the frame as a keyframe.
    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
