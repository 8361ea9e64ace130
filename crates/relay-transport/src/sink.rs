//! Sample sink interface and the channel sink.

use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use relay_capture::Frame;

use crate::error::TransportError;
use crate::{TransportResult, SAMPLE_CHANNEL_CAPACITY};

/// One media sample handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Encoded payload; the sink may keep it.
    pub data: Bytes,

    /// Display duration.
    pub duration: Duration,
}

impl From<&Frame> for Sample {
    fn from(frame: &Frame) -> Self {
        Self {
            data: frame.payload.clone(),
            duration: frame.duration,
        }
    }
}

/// Consumer of media samples.
///
/// Called from a single task, in frame order. Errors are reported back to the
/// emitter but never stop the session.
pub trait SampleSink: Send {
    /// Deliver one sample.
    fn write_sample(&mut self, sample: Sample) -> TransportResult<()>;

    /// Flush buffered output, if any.
    fn flush(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

impl<S: SampleSink + ?Sized> SampleSink for Box<S> {
    fn write_sample(&mut self, sample: Sample) -> TransportResult<()> {
        (**self).write_sample(sample)
    }

    fn flush(&mut self) -> TransportResult<()> {
        (**self).flush()
    }
}

/// Sink forwarding samples into a bounded crossbeam channel.
///
/// Never blocks: a full channel rejects the sample with
/// [`TransportError::Backpressure`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Sample>,
}

impl ChannelSink {
    /// Wrap an existing sender.
    pub fn new(tx: Sender<Sample>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver for its samples.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Sample>) {
        let (tx, rx) = bounded(capacity);
        (Self::new(tx), rx)
    }

    /// Channel sink with the default capacity.
    pub fn with_default_capacity() -> (Self, Receiver<Sample>) {
        Self::bounded(SAMPLE_CHANNEL_CAPACITY)
    }
}

impl SampleSink for ChannelSink {
    fn write_sample(&mut self, sample: Sample) -> TransportResult<()> {
        self.tx.try_send(sample).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Disconnected(_) => TransportError::ChannelDisconnected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(byte: u8) -> Sample {
        Sample {
            data: Bytes::from(vec![byte; 4]),
            duration: Duration::from_millis(16),
        }
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (mut sink, rx) = ChannelSink::bounded(4);
        sink.write_sample(sample(1)).unwrap();
        sink.write_sample(sample(2)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), sample(1));
        assert_eq!(rx.try_recv().unwrap(), sample(2));
    }

    #[test]
    fn test_channel_sink_full() {
        let (mut sink, _rx) = ChannelSink::bounded(1);
        sink.write_sample(sample(1)).unwrap();
        assert!(matches!(
            sink.write_sample(sample(2)),
            Err(TransportError::Backpressure)
        ));
    }

    #[test]
    fn test_channel_sink_disconnected() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        assert!(matches!(
            sink.write_sample(sample(1)),
            Err(TransportError::ChannelDisconnected)
        ));
    }

    #[test]
    fn test_sample_from_frame_shares_payload() {
        let frame = Frame::new(Bytes::from_static(b"abc"), Duration::from_millis(33), 0);
        let sample = Sample::from(&frame);
        assert_eq!(sample.data, frame.payload);
        assert_eq!(sample.duration, Duration::from_millis(33));
    }
}
