//! Error types for the capture module.

use thiserror::Error;

/// Errors that can occur while turning encoder output into frames.
///
/// Everything except [`CaptureError::Io`] is a framing error: the byte
/// stream can no longer be trusted and the session must end.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Stream closed before the container header was complete.
    #[error("Container header truncated: read {read} of {expected} bytes")]
    TruncatedHeader { read: usize, expected: usize },

    /// Stream closed in the middle of a frame header.
    #[error("Frame header truncated: read {read} of {expected} bytes")]
    TruncatedFrameHeader { read: usize, expected: usize },

    /// Declared frame length is zero or above the configured cap.
    #[error("Invalid frame size: {size} bytes (max {max})")]
    InvalidFrameSize { size: u32, max: u32 },

    /// Stream closed in the middle of a frame payload.
    #[error("Frame payload truncated: read {read} of {expected} bytes")]
    TruncatedPayload { read: usize, expected: usize },

    /// Elementary stream could not be split into NAL units.
    #[error("Malformed bitstream: {0}")]
    MalformedBitstream(String),

    /// Underlying read failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Returns true if the error describes corrupt or truncated framing.
    pub fn is_framing(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_framing() {
        assert!(CaptureError::InvalidFrameSize { size: 0, max: 1 }.is_framing());
        assert!(CaptureError::TruncatedPayload {
            read: 1,
            expected: 2
        }
        .is_framing());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        assert!(!CaptureError::from(io).is_framing());
    }

    #[test]
    fn test_display() {
        let err = CaptureError::InvalidFrameSize {
            size: 20_000_000,
            max: 10_485_760,
        };
        assert_eq!(
            err.to_string(),
            "Invalid frame size: 20000000 bytes (max 10485760)"
        );
    }
}
