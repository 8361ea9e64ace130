//! IVF container demuxing.
//!
//! The encoder writes a 32-byte file header followed by frame records, each a
//! 12-byte header (little-endian payload length, little-endian timestamp) and
//! the payload itself. The demuxer walks
//! `AwaitHeader → ReadFrameHeader → ReadFramePayload → … → Ended`, reading
//! headers through the fixed header pools and payloads through the tiered
//! [`BufferPool`]. Every payload is copied out of its pooled buffer before the
//! buffer is released, so the emitted [`Frame`] owns its bytes.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::pool::BufferPool;
use crate::{CaptureResult, FrameSource, MAX_FRAME_SIZE};

/// Size of the IVF file header.
pub const IVF_HEADER_SIZE: usize = 32;

/// Size of each IVF frame header.
pub const IVF_FRAME_HEADER_SIZE: usize = 12;

/// Signature at the start of every IVF file.
pub const IVF_SIGNATURE: [u8; 4] = *b"DKIF";

/// Decoded IVF file header.
///
/// Only used for diagnostics; the demuxer never rejects a stream based on
/// these fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfHeader {
    pub signature: [u8; 4],
    pub version: u16,
    pub header_len: u16,
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_den: u32,
    pub timebase_num: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    /// Decode the little-endian header fields.
    pub fn parse(bytes: &[u8; IVF_HEADER_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let tag_at = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];

        Self {
            signature: tag_at(0),
            version: u16_at(4),
            header_len: u16_at(6),
            fourcc: tag_at(8),
            width: u16_at(12),
            height: u16_at(14),
            timebase_den: u32_at(16),
            timebase_num: u32_at(20),
            frame_count: u32_at(24),
        }
    }

    /// Returns true if the header starts with `DKIF`.
    pub fn has_signature(&self) -> bool {
        self.signature == IVF_SIGNATURE
    }

    /// Codec fourcc as text, e.g. `VP80`.
    pub fn codec(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).into_owned()
    }

    fn is_vp8(&self) -> bool {
        &self.fourcc == b"VP80"
    }
}

/// Decoded IVF frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub size: u32,

    /// Presentation timestamp in timebase units.
    pub pts: u64,
}

impl FrameHeader {
    /// Decode a 12-byte frame header.
    pub fn parse(bytes: &[u8]) -> Self {
        let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&bytes[4..IVF_FRAME_HEADER_SIZE]);
        Self {
            size,
            pts: u64::from_le_bytes(pts),
        }
    }
}

/// Demuxer limits.
#[derive(Debug, Clone, Copy)]
pub struct DemuxConfig {
    /// Largest accepted payload; bigger declared sizes end the session.
    pub max_frame_size: u32,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    AwaitHeader,
    ReadFrameHeader,
    Ended,
}

/// Reads IVF frames from an encoder's output stream.
pub struct IvfDemuxer<R> {
    reader: R,
    pool: Arc<BufferPool>,
    config: DemuxConfig,
    frame_duration: Duration,
    state: DemuxState,
    header: Option<IvfHeader>,
    sequence: u64,
}

impl<R: AsyncRead + Unpin + Send> IvfDemuxer<R> {
    /// Create a demuxer over `reader`.
    pub fn new(
        reader: R,
        pool: Arc<BufferPool>,
        frame_duration: Duration,
        config: DemuxConfig,
    ) -> Self {
        Self {
            reader,
            pool,
            config,
            frame_duration,
            state: DemuxState::AwaitHeader,
            header: None,
            sequence: 0,
        }
    }

    /// The container header, once read.
    pub fn header(&self) -> Option<&IvfHeader> {
        self.header.as_ref()
    }

    /// Frames produced so far.
    pub fn frames_read(&self) -> u64 {
        self.sequence
    }

    /// Returns true once the stream has ended or failed.
    pub fn is_ended(&self) -> bool {
        self.state == DemuxState::Ended
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends on a frame boundary. Any error
    /// is terminal; later calls return `Ok(None)`.
    pub async fn next_frame(&mut self) -> CaptureResult<Option<Frame>> {
        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.state = DemuxState::Ended;
        }
        result
    }

    async fn advance(&mut self) -> CaptureResult<Option<Frame>> {
        match self.state {
            DemuxState::Ended => return Ok(None),
            DemuxState::AwaitHeader => {
                self.read_header().await?;
                self.state = DemuxState::ReadFrameHeader;
            }
            DemuxState::ReadFrameHeader => {}
        }

        let Some(frame_header) = self.read_frame_header().await? else {
            debug!(frames = self.sequence, "IVF stream ended");
            return Ok(None);
        };

        if frame_header.size == 0 || frame_header.size > self.config.max_frame_size {
            warn!(size = frame_header.size, "Invalid frame size");
            return Err(CaptureError::InvalidFrameSize {
                size: frame_header.size,
                max: self.config.max_frame_size,
            });
        }

        let payload = self.read_payload(frame_header.size as usize).await?;
        let is_keyframe = match &self.header {
            Some(header) if header.is_vp8() => payload[0] & 0x01 == 0,
            _ => false,
        };

        let frame = Frame::new(payload, self.frame_duration, self.sequence)
            .with_pts(frame_header.pts)
            .with_keyframe(is_keyframe);
        self.sequence += 1;

        Ok(Some(frame))
    }

    async fn read_header(&mut self) -> CaptureResult<IvfHeader> {
        let mut buf = self.pool.acquire_header();
        let read = read_full(&mut self.reader, &mut buf).await?;
        if read < IVF_HEADER_SIZE {
            warn!(read, "Failed to read IVF header");
            return Err(CaptureError::TruncatedHeader {
                read,
                expected: IVF_HEADER_SIZE,
            });
        }

        let mut bytes = [0u8; IVF_HEADER_SIZE];
        bytes.copy_from_slice(&buf);
        drop(buf);

        let header = IvfHeader::parse(&bytes);
        if header.has_signature() {
            info!(
                codec = %header.codec(),
                width = header.width,
                height = header.height,
                timebase = %format!("{}/{}", header.timebase_num, header.timebase_den),
                "IVF stream header"
            );
        } else {
            warn!(signature = ?header.signature, "IVF header without DKIF signature");
        }

        self.header = Some(header.clone());
        Ok(header)
    }

    async fn read_frame_header(&mut self) -> CaptureResult<Option<FrameHeader>> {
        let mut buf = self.pool.acquire_frame_header();
        let read = read_full(&mut self.reader, &mut buf).await?;
        match read {
            0 => Ok(None),
            IVF_FRAME_HEADER_SIZE => Ok(Some(FrameHeader::parse(&buf))),
            read => Err(CaptureError::TruncatedFrameHeader {
                read,
                expected: IVF_FRAME_HEADER_SIZE,
            }),
        }
    }

    async fn read_payload(&mut self, size: usize) -> CaptureResult<Bytes> {
        let mut buf = self.pool.acquire(size);
        trace!(size, tier = ?buf.tier(), "Reading frame payload");

        let read = read_full(&mut self.reader, &mut buf).await?;
        if read < size {
            return Err(CaptureError::TruncatedPayload {
                read,
                expected: size,
            });
        }

        // The sink may hold on to the payload, so it must not alias the pool.
        let payload = Bytes::copy_from_slice(&buf);
        buf.release();
        Ok(payload)
    }
}

impl<R: AsyncRead + Unpin + Send> FrameSource for IvfDemuxer<R> {
    async fn next_frame(&mut self) -> CaptureResult<Option<Frame>> {
        IvfDemuxer::next_frame(self).await
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
///
/// Returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
