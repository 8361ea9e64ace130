//! H.264 elementary stream reframing.
//!
//! When the encoder writes a raw Annex B stream there is no size framing, so
//! units are recovered by scanning for start codes. Parameter sets are held
//! back and prepended to the next IDR picture; decoders need them right in
//! front of the key frame that references them, and on their own they make
//! useless samples.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::ivf::DemuxConfig;
use crate::nal::{find_start_code, trim_trailing_zeros, NalUnit, NalUnitType, START_CODE};
use crate::{CaptureResult, FrameSource};

const READ_CHUNK: usize = 64 * 1024;

/// Splits an Annex B byte stream into NAL units as bytes arrive.
pub struct AnnexBReader<R> {
    reader: R,
    buf: BytesMut,
    max_unit_size: usize,
    /// `buf` starts with a start code of this length.
    aligned: Option<usize>,
    /// Resume offset for the next start code search.
    scan_pos: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin + Send> AnnexBReader<R> {
    /// Create a reader rejecting units larger than `max_unit_size`.
    pub fn new(reader: R, max_unit_size: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_unit_size,
            aligned: None,
            scan_pos: 0,
            eof: false,
        }
    }

    /// Read the next NAL unit. `Ok(None)` at end of stream.
    pub async fn next_unit(&mut self) -> CaptureResult<Option<NalUnit>> {
        loop {
            if self.aligned.is_none() {
                match find_start_code(&self.buf, 0) {
                    Some((pos, len)) => {
                        if pos > 0 {
                            debug!(skipped = pos, "Skipping bytes before start code");
                        }
                        self.buf.advance(pos);
                        self.aligned = Some(len);
                        self.scan_pos = len;
                    }
                    None if self.eof => {
                        if self.buf.iter().all(|b| *b == 0) {
                            return Ok(None);
                        }
                        return Err(CaptureError::MalformedBitstream(format!(
                            "{} trailing bytes without a start code",
                            self.buf.len()
                        )));
                    }
                    None => {
                        // Keep a possible partial start code, drop the rest.
                        let skip = self.buf.len().saturating_sub(3);
                        if skip > 0 {
                            debug!(skipped = skip, "Skipping bytes before start code");
                            self.buf.advance(skip);
                        }
                    }
                }
            }

            if let Some(code_len) = self.aligned {
                if let Some((next, _)) = find_start_code(&self.buf, self.scan_pos) {
                    let mut unit = self.buf.split_to(next);
                    unit.advance(code_len);
                    self.aligned = None;
                    match make_unit(unit) {
                        Some(nal) => return Ok(Some(nal)),
                        None => continue,
                    }
                }

                if self.eof {
                    let mut unit = self.buf.split();
                    unit.advance(code_len);
                    self.aligned = None;
                    return Ok(make_unit(unit));
                }

                let pending = self.buf.len() - code_len;
                if pending > self.max_unit_size {
                    return Err(CaptureError::MalformedBitstream(format!(
                        "NAL unit exceeds {} bytes without a following start code",
                        self.max_unit_size
                    )));
                }
                self.scan_pos = self.buf.len().saturating_sub(3).max(code_len);
            }

            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }
}

fn make_unit(mut data: BytesMut) -> Option<NalUnit> {
    let len = trim_trailing_zeros(&data).len();
    data.truncate(len);
    NalUnit::from_bytes(data.freeze())
}

/// A start-coded access unit ready to be emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// One or more start-coded NAL units.
    pub data: Bytes,

    /// Whether the unit carries an IDR picture.
    pub is_keyframe: bool,
}

/// Groups NAL units into emittable access units.
///
/// SPS/PPS go to a pending cache that is flushed in front of the next IDR
/// picture. Access unit delimiters are dropped. Other non-picture units (SEI)
/// ride along with the next picture of any kind. All slices of one picture
/// form a single access unit, which is complete once the next picture or
/// non-picture unit arrives.
#[derive(Debug, Default)]
pub struct Reframer {
    parameter_sets: BytesMut,
    prefix: BytesMut,
    picture: BytesMut,
    picture_is_key: bool,
}

impl Reframer {
    /// Create an empty reframer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one unit; returns the previous access unit once it is complete.
    pub fn push(&mut self, nal: NalUnit) -> Option<AccessUnit> {
        let is_key = nal.nal_type == NalUnitType::IdrSlice;
        if nal.nal_type.is_picture() {
            if !self.picture.is_empty() && !nal.starts_picture() {
                trace!(len = nal.data.len(), "Appending slice to picture");
                self.picture_is_key |= is_key;
                self.picture.put_slice(&START_CODE);
                self.picture.put_slice(&nal.data);
                return None;
            }

            let done = self.flush();
            if is_key {
                self.picture.put(self.parameter_sets.split());
            }
            self.picture.put(self.prefix.split());
            self.picture.put_slice(&START_CODE);
            self.picture.put_slice(&nal.data);
            self.picture_is_key = is_key;
            return done;
        }

        let done = self.flush();
        match nal.nal_type {
            NalUnitType::Sps | NalUnitType::Pps => {
                trace!(nal_type = ?nal.nal_type, len = nal.data.len(), "Caching parameter set");
                self.parameter_sets.put_slice(&START_CODE);
                self.parameter_sets.put_slice(&nal.data);
            }
            NalUnitType::Aud => {}
            _ => {
                self.prefix.put_slice(&START_CODE);
                self.prefix.put_slice(&nal.data);
            }
        }
        done
    }

    /// Take the picture being assembled, if any.
    ///
    /// Called at end of stream to emit the last access unit.
    pub fn flush(&mut self) -> Option<AccessUnit> {
        if self.picture.is_empty() {
            return None;
        }
        Some(AccessUnit {
            data: self.picture.split().freeze(),
            is_keyframe: std::mem::take(&mut self.picture_is_key),
        })
    }

    /// Bytes of parameter sets waiting for a key frame.
    pub fn pending_parameter_sets(&self) -> usize {
        self.parameter_sets.len()
    }

    /// Bytes of the picture being assembled.
    pub fn pending_picture(&self) -> usize {
        self.picture.len()
    }
}

/// Frame source over a raw H.264 elementary stream.
pub struct AnnexBDemuxer<R> {
    reader: AnnexBReader<R>,
    reframer: Reframer,
    config: DemuxConfig,
    frame_duration: Duration,
    sequence: u64,
    ended: bool,
}

impl<R: AsyncRead + Unpin + Send> AnnexBDemuxer<R> {
    /// Create a demuxer over `reader`.
    pub fn new(reader: R, frame_duration: Duration, config: DemuxConfig) -> Self {
        Self {
            reader: AnnexBReader::new(reader, config.max_frame_size as usize),
            reframer: Reframer::new(),
            config,
            frame_duration,
            sequence: 0,
            ended: false,
        }
    }

    /// Frames produced so far.
    pub fn frames_read(&self) -> u64 {
        self.sequence
    }

    /// Read the next access unit as a frame.
    ///
    /// End of stream while a unit is pending is a normal termination. Any
    /// error is terminal; later calls return `Ok(None)`.
    pub async fn next_frame(&mut self) -> CaptureResult<Option<Frame>> {
        if self.ended {
            return Ok(None);
        }
        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.ended = true;
        }
        result
    }

    async fn advance(&mut self) -> CaptureResult<Option<Frame>> {
        let max = self.config.max_frame_size as usize;
        loop {
            let Some(nal) = self.reader.next_unit().await? else {
                if let Some(unit) = self.reframer.flush() {
                    return self.emit(unit).map(Some);
                }
                if self.reframer.pending_parameter_sets() > 0 {
                    warn!("Stream ended with parameter sets but no key frame");
                }
                debug!(frames = self.sequence, "Elementary stream ended");
                return Ok(None);
            };

            let done = self.reframer.push(nal);
            if self.reframer.pending_picture() > max {
                return Err(invalid_size(self.reframer.pending_picture(), max));
            }
            if let Some(unit) = done {
                return self.emit(unit).map(Some);
            }
        }
    }

    fn emit(&mut self, unit: AccessUnit) -> CaptureResult<Frame> {
        let max = self.config.max_frame_size as usize;
        if unit.data.len() > max {
            return Err(invalid_size(unit.data.len(), max));
        }

        let frame = Frame::new(unit.data, self.frame_duration, self.sequence)
            .with_keyframe(unit.is_keyframe);
        self.sequence += 1;
        Ok(frame)
    }
}

fn invalid_size(size: usize, max: usize) -> CaptureError {
    CaptureError::InvalidFrameSize {
        size: u32::try_from(size).unwrap_or(u32::MAX),
        max: u32::try_from(max).unwrap_or(u32::MAX),
    }
}

impl<R: AsyncRead + Unpin + Send> FrameSource for AnnexBDemuxer<R> {
    async fn next_frame(&mut self) -> CaptureResult<Option<Frame>> {
        AnnexBDemuxer::next_frame(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR1: &[u8] = &[0x65, 0x88, 0x84, 0x01];
    const P: &[u8] = &[0x41, 0x9A, 0x02];
    const IDR2: &[u8] = &[0x65, 0x88, 0x84, 0x02];
    const SEI: &[u8] = &[0x06, 0x05, 0x11];
    const AUD: &[u8] = &[0x09, 0xF0];
    // first_mb_in_slice != 0: continuation slices.
    const IDR1_SLICE2: &[u8] = &[0x65, 0x44, 0x84, 0x01];
    const P_SLICE2: &[u8] = &[0x41, 0x44, 0x02];

    fn stream(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(unit);
        }
        out
    }

    fn nal(data: &'static [u8]) -> NalUnit {
        NalUnit::from_bytes(Bytes::from_static(data)).unwrap()
    }

    /// Yields at most `chunk` bytes per read to exercise split start codes.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let end = (self.pos + self.chunk)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.data[pos..end]);
            self.pos = end;
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn demuxer(bytes: Vec<u8>) -> AnnexBDemuxer<Cursor<Vec<u8>>> {
        AnnexBDemuxer::new(
            Cursor::new(bytes),
            Duration::from_millis(33),
            DemuxConfig::default(),
        )
    }

    #[test]
    fn test_reframer_caches_parameter_sets() {
        let mut reframer = Reframer::new();
        assert!(reframer.push(nal(SPS)).is_none());
        assert!(reframer.push(nal(PPS)).is_none());

        assert!(reframer.push(nal(IDR1)).is_none());

        let key = reframer.push(nal(P)).unwrap();
        assert!(key.is_keyframe);
        assert_eq!(key.data.as_ref(), stream(&[SPS, PPS, IDR1]).as_slice());

        let inter = reframer.flush().unwrap();
        assert!(!inter.is_keyframe);
        assert_eq!(inter.data.as_ref(), stream(&[P]).as_slice());
    }

    #[test]
    fn test_reframer_attaches_cache_once() {
        let mut reframer = Reframer::new();
        let units = [SPS, PPS, IDR1, P, IDR2];
        let mut emitted: Vec<_> = units
            .iter()
            .filter_map(|u| reframer.push(nal(u)))
            .collect();
        emitted.extend(reframer.flush());

        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0].data.as_ref(), stream(&[SPS, PPS, IDR1]).as_slice());
        assert_eq!(emitted[1].data.as_ref(), stream(&[P]).as_slice());
        assert_eq!(emitted[2].data.as_ref(), stream(&[IDR2]).as_slice());
        assert!(emitted[2].is_keyframe);
        assert_eq!(reframer.pending_parameter_sets(), 0);
    }

    #[test]
    fn test_reframer_drops_aud_and_prefixes_sei() {
        let mut reframer = Reframer::new();
        assert!(reframer.push(nal(AUD)).is_none());
        assert!(reframer.push(nal(SEI)).is_none());
        assert!(reframer.push(nal(P)).is_none());
        let unit = reframer.flush().unwrap();
        assert_eq!(unit.data.as_ref(), stream(&[SEI, P]).as_slice());
        assert!(reframer.flush().is_none());
    }

    #[test]
    fn test_reframer_groups_slices_of_one_picture() {
        let mut reframer = Reframer::new();
        let units = [SPS, PPS, IDR1, IDR1_SLICE2, P, P_SLICE2];
        let mut emitted: Vec<_> = units
            .iter()
            .filter_map(|u| reframer.push(nal(u)))
            .collect();
        emitted.extend(reframer.flush());

        assert_eq!(emitted.len(), 2);
        assert_eq!(
            emitted[0].data.as_ref(),
            stream(&[SPS, PPS, IDR1, IDR1_SLICE2]).as_slice()
        );
        assert!(emitted[0].is_keyframe);
        assert_eq!(emitted[1].data.as_ref(), stream(&[P, P_SLICE2]).as_slice());
        assert!(!emitted[1].is_keyframe);
    }

    #[test]
    fn test_reframer_parameter_sets_close_picture() {
        let mut reframer = Reframer::new();
        assert!(reframer.push(nal(P)).is_none());
        let inter = reframer.push(nal(SPS)).unwrap();
        assert_eq!(inter.data.as_ref(), stream(&[P]).as_slice());
        assert!(reframer.push(nal(PPS)).is_none());
        assert!(reframer.push(nal(IDR2)).is_none());
        let key = reframer.flush().unwrap();
        assert_eq!(key.data.as_ref(), stream(&[SPS, PPS, IDR2]).as_slice());
    }

    #[tokio::test]
    async fn test_reader_splits_units() {
        let mut reader = AnnexBReader::new(Cursor::new(stream(&[SPS, PPS, IDR1])), 1024);
        assert_eq!(reader.next_unit().await.unwrap(), Some(nal(SPS)));
        assert_eq!(reader.next_unit().await.unwrap(), Some(nal(PPS)));
        assert_eq!(reader.next_unit().await.unwrap(), Some(nal(IDR1)));
        assert_eq!(reader.next_unit().await.unwrap(), None);
        assert_eq!(reader.next_unit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_handles_split_reads() {
        let data = stream(&[SPS, PPS, IDR1, P, IDR2]);
        for chunk in 1..8 {
            let trickle = Trickle {
                data: data.clone(),
                pos: 0,
                chunk,
            };
            let mut reader = AnnexBReader::new(trickle, 1024);
            let mut units = Vec::new();
            while let Some(unit) = reader.next_unit().await.unwrap() {
                units.push(unit);
            }
            assert_eq!(
                units,
                vec![nal(SPS), nal(PPS), nal(IDR1), nal(P), nal(IDR2)],
                "chunk size {chunk}"
            );
        }
    }

    #[tokio::test]
    async fn test_reader_rejects_runaway_unit() {
        let mut data = START_CODE.to_vec();
        data.push(0x65);
        data.extend(std::iter::repeat(0x42).take(4096));
        let mut reader = AnnexBReader::new(Cursor::new(data), 1024);
        let err = reader.next_unit().await.unwrap_err();
        assert!(matches!(err, CaptureError::MalformedBitstream(_)));
        assert!(err.is_framing());
    }

    #[tokio::test]
    async fn test_reader_rejects_stream_without_start_code() {
        let mut reader = AnnexBReader::new(Cursor::new(vec![0x65, 0x88, 0x84]), 1024);
        assert!(matches!(
            reader.next_unit().await,
            Err(CaptureError::MalformedBitstream(_))
        ));
    }

    #[tokio::test]
    async fn test_demuxer_emits_access_units() {
        let mut demuxer = demuxer(stream(&[SPS, PPS, IDR1, P]));

        let first = demuxer.next_frame().await.unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), stream(&[SPS, PPS, IDR1]).as_slice());
        assert!(first.is_keyframe);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.duration, Duration::from_millis(33));
        assert_eq!(first.pts, None);

        let second = demuxer.next_frame().await.unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), stream(&[P]).as_slice());
        assert_eq!(second.sequence, 1);

        assert!(demuxer.next_frame().await.unwrap().is_none());
        assert_eq!(demuxer.frames_read(), 2);
    }

    #[tokio::test]
    async fn test_demuxer_emits_one_frame_per_picture() {
        let mut demuxer = demuxer(stream(&[SPS, PPS, IDR1, IDR1_SLICE2, P, P_SLICE2]));

        let key = demuxer.next_frame().await.unwrap().unwrap();
        assert!(key.is_keyframe);
        assert_eq!(
            key.payload.as_ref(),
            stream(&[SPS, PPS, IDR1, IDR1_SLICE2]).as_slice()
        );

        let inter = demuxer.next_frame().await.unwrap().unwrap();
        assert!(!inter.is_keyframe);
        assert_eq!(inter.payload.as_ref(), stream(&[P, P_SLICE2]).as_slice());

        assert!(demuxer.next_frame().await.unwrap().is_none());
        assert_eq!(demuxer.frames_read(), 2);
    }

    #[tokio::test]
    async fn test_demuxer_empty_stream_ends_cleanly() {
        assert!(demuxer(Vec::new()).next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_demuxer_rejects_oversized_access_unit() {
        let mut big = vec![0x65];
        big.extend(std::iter::repeat(0x11).take(600));
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&big);

        let mut demuxer = AnnexBDemuxer::new(
            Cursor::new(data),
            Duration::from_millis(33),
            DemuxConfig { max_frame_size: 512 },
        );
        let err = demuxer.next_frame().await.unwrap_err();
        assert!(err.is_framing());
        assert!(demuxer.next_frame().await.unwrap().is_none());
    }
}
