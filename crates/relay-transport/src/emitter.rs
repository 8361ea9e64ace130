//! Frame to sample forwarding.

use std::time::Instant;

use relay_capture::Frame;
use tracing::{info, trace, warn};

use crate::sink::{Sample, SampleSink};
use crate::TransportResult;

/// Counters kept by a [`SampleEmitter`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EmitterStats {
    /// Frames handed to the sink, accepted or not.
    pub frames_emitted: u64,

    /// Frames the sink accepted.
    pub frames_sent: u64,

    /// Payload bytes the sink accepted.
    pub bytes_sent: u64,

    /// Frames the sink rejected.
    pub sink_errors: u64,

    /// Throughput reports logged so far.
    pub reports: u64,

    /// Frames per second since the emitter was created.
    pub fps: f64,
}

/// Forwards frames to a sink in the order they are given.
pub struct SampleEmitter<S> {
    sink: S,
    report_interval: u64,
    started: Instant,
    stats: EmitterStats,
}

impl<S: SampleSink> SampleEmitter<S> {
    /// Create an emitter logging throughput every `report_interval` frames.
    pub fn new(sink: S, report_interval: u64) -> Self {
        Self {
            sink,
            report_interval: report_interval.max(1),
            started: Instant::now(),
            stats: EmitterStats::default(),
        }
    }

    /// Send one frame to the sink.
    ///
    /// A sink error is logged, counted and returned; the caller keeps going.
    pub fn emit(&mut self, frame: &Frame) -> TransportResult<()> {
        self.stats.frames_emitted += 1;
        let len = frame.payload.len() as u64;

        let result = self.sink.write_sample(Sample::from(frame));
        match &result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += len;
                trace!(sequence = frame.sequence, len, "Sample written");
            }
            Err(e) => {
                self.stats.sink_errors += 1;
                warn!(sequence = frame.sequence, error = %e, "Sink rejected sample");
            }
        }

        if self.stats.frames_emitted % self.report_interval == 0 {
            self.stats.reports += 1;
            info!(
                frames = self.stats.frames_emitted,
                fps = format!("{:.2}", self.fps()),
                "Frame throughput"
            );
        }

        result
    }

    /// Current counters.
    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            fps: self.fps(),
            ..self.stats
        }
    }

    /// Flush the sink.
    pub fn flush(&mut self) -> TransportResult<()> {
        self.sink.flush()
    }

    /// Access the sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the emitter, returning the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    fn fps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.stats.frames_emitted as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::error::TransportError;

    #[derive(Default)]
    struct RecordingSink {
        samples: Vec<Sample>,
        reject_every: Option<usize>,
        calls: usize,
    }

    impl SampleSink for RecordingSink {
        fn write_sample(&mut self, sample: Sample) -> TransportResult<()> {
            self.calls += 1;
            if let Some(n) = self.reject_every {
                if self.calls % n == 0 {
                    return Err(TransportError::Rejected("test".into()));
                }
            }
            self.samples.push(sample);
            Ok(())
        }
    }

    fn frame(sequence: u64, len: usize) -> Frame {
        Frame::new(
            Bytes::from(vec![sequence as u8; len]),
            Duration::from_millis(16),
            sequence,
        )
    }

    #[test]
    fn test_emit_preserves_order() {
        let mut emitter = SampleEmitter::new(RecordingSink::default(), 200);
        for i in 0..5 {
            emitter.emit(&frame(i, 10 + i as usize)).unwrap();
        }

        let sink = emitter.into_sink();
        let lens: Vec<_> = sink.samples.iter().map(|s| s.data.len()).collect();
        assert_eq!(lens, vec![10, 11, 12, 13, 14]);
        assert!(sink
            .samples
            .iter()
            .all(|s| s.duration == Duration::from_millis(16)));
    }

    #[test]
    fn test_sink_errors_are_counted_not_fatal() {
        let sink = RecordingSink {
            reject_every: Some(2),
            ..Default::default()
        };
        let mut emitter = SampleEmitter::new(sink, 200);

        let results: Vec<_> = (0..4).map(|i| emitter.emit(&frame(i, 8))).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert!(results[3].is_err());

        let stats = emitter.stats();
        assert_eq!(stats.frames_emitted, 4);
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.sink_errors, 2);
        assert_eq!(stats.bytes_sent, 16);
        assert_eq!(emitter.into_sink().samples.len(), 2);
    }

    #[test]
    fn test_reports_every_interval() {
        let mut emitter = SampleEmitter::new(RecordingSink::default(), 3);
        for i in 0..7 {
            emitter.emit(&frame(i, 1)).unwrap();
        }
        assert_eq!(emitter.stats().reports, 2);
    }
}
