//! One capture session: encoder process, demuxer and emitter.
//!
//! The hot path runs as a single tokio task reading the encoder's stdout,
//! demuxing frames and handing them to the sink in order. Every read is
//! raced against the session token. Whatever ends the pipeline (stop
//! request, end of stream, framing error) cancels the token so the encoder
//! is killed and the stderr drain exits.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use relay_capture::{
    AnnexBDemuxer, BufferPool, CaptureError, DemuxConfig, FrameSource, IvfDemuxer,
};
use relay_encoder::{EncoderCommand, ProcessSupervisor, TerminationOutcome};
use relay_ipc::{OutputFraming, StopReason, StreamConfig};
use relay_transport::{SampleEmitter, SampleSink};

use crate::metrics::MetricsCollector;
use crate::EngineResult;

/// How a session ended.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Why the session stopped.
    pub reason: StopReason,

    /// Frames the sink accepted.
    pub frames_sent: u64,

    /// How the encoder process ended.
    pub termination: Option<TerminationOutcome>,
}

/// A running capture session.
pub struct CaptureSession {
    cancel: CancellationToken,
    requested: Arc<Mutex<Option<StopReason>>>,
    metrics: Arc<MetricsCollector>,
    pool: Arc<BufferPool>,
    task: JoinHandle<SessionOutcome>,
}

impl CaptureSession {
    /// Launch the configured encoder and start forwarding its frames to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(config: &StreamConfig, sink: S, cancel: CancellationToken) -> EngineResult<Self>
    where
        S: SampleSink + 'static,
    {
        Self::start_with_command(EncoderCommand::from_config(config), config, sink, cancel)
    }

    /// Like [`CaptureSession::start`], running `command` as the encoder.
    #[instrument(name = "start_session", skip_all, fields(framing = config.framing.name()))]
    pub fn start_with_command<S>(
        command: EncoderCommand,
        config: &StreamConfig,
        sink: S,
        cancel: CancellationToken,
    ) -> EngineResult<Self>
    where
        S: SampleSink + 'static,
    {
        config.validate()?;

        let (supervisor, stdout) = ProcessSupervisor::spawn(&command, cancel.clone())?;

        let metrics = Arc::new(MetricsCollector::new(
            config.settings.frame_rate as f32,
            config.settings.bitrate_kbps,
        ));
        metrics.start();

        let pool = Arc::new(BufferPool::new());
        let requested = Arc::new(Mutex::new(None));

        let pipeline = Pipeline {
            config: config.clone(),
            cancel: cancel.clone(),
            requested: Arc::clone(&requested),
            metrics: Arc::clone(&metrics),
            pool: Arc::clone(&pool),
        };
        let span = tracing::info_span!("capture", encoder = %supervisor.name());
        let task = tokio::spawn(pipeline.run(supervisor, stdout, sink).instrument(span));

        info!("Capture session started");

        Ok(Self {
            cancel,
            requested,
            metrics,
            pool,
            task,
        })
    }

    /// Ask the session to stop. The first reason given wins.
    pub fn stop(&self, reason: StopReason) {
        self.requested.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    /// Returns true once the pipeline task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Session metrics, updated live by the pipeline.
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// The session's buffer pool.
    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    /// Wait for the pipeline to finish.
    pub async fn wait(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Capture task failed");
                self.cancel.cancel();
                SessionOutcome {
                    reason: StopReason::TaskFailed {
                        message: e.to_string(),
                    },
                    frames_sent: self.metrics.frames_sent(),
                    termination: None,
                }
            }
        }
    }
}

enum PumpEnd {
    Cancelled,
    StreamEnded,
    Failed(CaptureError),
}

struct Pipeline {
    config: StreamConfig,
    cancel: CancellationToken,
    requested: Arc<Mutex<Option<StopReason>>>,
    metrics: Arc<MetricsCollector>,
    pool: Arc<BufferPool>,
}

impl Pipeline {
    async fn run<S: SampleSink>(
        self,
        supervisor: ProcessSupervisor,
        stdout: tokio::process::ChildStdout,
        sink: S,
    ) -> SessionOutcome {
        let mut emitter = SampleEmitter::new(sink, self.config.fps_report_interval);
        let frame_duration = self.config.settings.frame_duration();
        let demux_config = DemuxConfig {
            max_frame_size: self.config.max_frame_size,
        };

        let end = match self.config.framing {
            OutputFraming::Ivf => {
                let mut source =
                    IvfDemuxer::new(stdout, Arc::clone(&self.pool), frame_duration, demux_config);
                self.pump(&mut source, &mut emitter, None).await
            }
            OutputFraming::AnnexB => {
                let mut source = AnnexBDemuxer::new(stdout, frame_duration, demux_config);
                let mut pacer = time::interval(frame_duration);
                pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.pump(&mut source, &mut emitter, Some(pacer)).await
            }
        };

        let (reason, termination) = match end {
            PumpEnd::Cancelled => {
                let reason = self
                    .requested
                    .lock()
                    .take()
                    .unwrap_or(StopReason::UserRequested);
                debug!(?reason, "Capture cancelled");
                (reason, supervisor.terminate().await)
            }
            PumpEnd::StreamEnded => {
                let termination = supervisor.wait_for_exit().await;
                let reason = if termination.is_unexpected_exit() {
                    StopReason::EncoderExited {
                        message: termination.describe(),
                    }
                } else {
                    StopReason::StreamEnded
                };
                (reason, termination)
            }
            PumpEnd::Failed(e) => {
                error!(error = %e, "Framing error, ending session");
                let termination = supervisor.terminate().await;
                // A dying encoder usually truncates its output; report the root cause.
                let reason = if termination.is_unexpected_exit() {
                    StopReason::EncoderExited {
                        message: termination.describe(),
                    }
                } else {
                    StopReason::FramingError {
                        message: e.to_string(),
                    }
                };
                (reason, termination)
            }
        };

        self.cancel.cancel();
        supervisor.shutdown().await;
        self.metrics.stop();

        if let Err(e) = emitter.flush() {
            warn!(error = %e, "Failed to flush sink");
        }

        let stats = emitter.stats();
        info!(
            reason = %reason.message(),
            frames = stats.frames_sent,
            bytes = stats.bytes_sent,
            sink_errors = stats.sink_errors,
            "Capture session ended"
        );

        SessionOutcome {
            reason,
            frames_sent: stats.frames_sent,
            termination: Some(termination),
        }
    }

    async fn pump<F: FrameSource, S: SampleSink>(
        &self,
        source: &mut F,
        emitter: &mut SampleEmitter<S>,
        mut pacer: Option<Interval>,
    ) -> PumpEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = source.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return PumpEnd::StreamEnded,
                Err(e) => return PumpEnd::Failed(e),
            };

            if let Some(pacer) = pacer.as_mut() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                    _ = pacer.tick() => {}
                }
            }

            match emitter.emit(&frame) {
                Ok(()) => self.metrics.record_frame(frame.payload.len() as u64),
                Err(_) => self.metrics.record_sink_rejection(),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::time::{Duration, Instant};

    use relay_capture::PoolTier;
    use relay_transport::{ChannelSink, Sample, TransportError, TransportResult};

    use super::*;

    fn ivf_file(sizes: &[u32]) -> tempfile::NamedTempFile {
        let mut data = Vec::new();
        data.extend_from_slice(b"DKIF");
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&32u16.to_le_bytes());
        data.extend_from_slice(b"VP80");
        data.extend_from_slice(&1920u16.to_le_bytes());
        data.extend_from_slice(&1080u16.to_le_bytes());
        data.extend_from_slice(&60u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&(sizes.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());

        for (pts, size) in sizes.iter().enumerate() {
            data.extend_from_slice(&size.to_le_bytes());
            data.extend_from_slice(&(pts as u64).to_le_bytes());
            data.extend(std::iter::repeat(pts as u8).take(*size as usize));
        }

        file_with(&data)
    }

    fn file_with(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn cat(file: &tempfile::NamedTempFile) -> EncoderCommand {
        EncoderCommand::new("cat", [file.path().to_string_lossy().into_owned()])
    }

    #[tokio::test]
    async fn test_ivf_session_end_to_end() {
        let file = ivf_file(&[100, 140_000, 600_000]);
        let (sink, rx) = ChannelSink::bounded(16);

        let session = CaptureSession::start_with_command(
            cat(&file),
            &StreamConfig::default(),
            sink,
            CancellationToken::new(),
        )
        .unwrap();
        let pool = session.pool();
        let outcome = session.wait().await;

        assert_eq!(outcome.reason, StopReason::StreamEnded);
        assert_eq!(outcome.frames_sent, 3);
        assert_eq!(outcome.termination, Some(TerminationOutcome::Completed));

        let samples: Vec<_> = rx.try_iter().collect();
        let sizes: Vec<_> = samples.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![100, 140_000, 600_000]);
        assert!(samples[1].data.iter().all(|b| *b == 1));

        let stats = pool.stats();
        // 140000 bytes exceeds the 128 KiB medium tier.
        assert_eq!(stats.tier(PoolTier::Small).acquired, 1);
        assert_eq!(stats.tier(PoolTier::Medium).acquired, 0);
        assert_eq!(stats.tier(PoolTier::Large).acquired, 1);
        assert_eq!(stats.oversized, 1);
    }

    #[tokio::test]
    async fn test_invalid_frame_size_ends_session() {
        let file = ivf_file(&[50, 0, 70]);
        let (sink, rx) = ChannelSink::bounded(16);

        let session = CaptureSession::start_with_command(
            cat(&file),
            &StreamConfig::default(),
            sink,
            CancellationToken::new(),
        )
        .unwrap();
        let outcome = session.wait().await;

        assert!(matches!(outcome.reason, StopReason::FramingError { .. }));
        assert!(outcome.reason.is_failure());
        assert_eq!(outcome.frames_sent, 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[tokio::test]
    async fn test_stop_kills_encoder() {
        let command = EncoderCommand::new("sh", ["-c", "exec sleep 30"]);
        let (sink, _rx) = ChannelSink::bounded(4);
        let cancel = CancellationToken::new();

        let session = CaptureSession::start_with_command(
            command,
            &StreamConfig::default(),
            sink,
            cancel.clone(),
        )
        .unwrap();
        session.stop(StopReason::TransportClosed);
        session.stop(StopReason::UserRequested);

        let outcome = tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap();
        assert_eq!(outcome.reason, StopReason::TransportClosed);
        assert_eq!(outcome.termination, Some(TerminationOutcome::Killed));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_encoder_exit() {
        let command = EncoderCommand::new("sh", ["-c", "exit 7"]);
        let (sink, _rx) = ChannelSink::bounded(4);

        let session = CaptureSession::start_with_command(
            command,
            &StreamConfig::default(),
            sink,
            CancellationToken::new(),
        )
        .unwrap();
        let outcome = session.wait().await;

        // Depending on timing the exit status or the truncated header is seen first.
        assert!(matches!(
            outcome.reason,
            StopReason::EncoderExited { .. } | StopReason::FramingError { .. }
        ));
        assert!(outcome.reason.is_failure());
        assert_eq!(outcome.frames_sent, 0);
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let command = EncoderCommand::new("/nonexistent/encoder", Vec::<String>::new());
        let (sink, _rx) = ChannelSink::bounded(4);
        let result = CaptureSession::start_with_command(
            command,
            &StreamConfig::default(),
            sink,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(crate::EngineError::Encoder(_))));
    }

    #[tokio::test]
    async fn test_sink_errors_do_not_stop_session() {
        struct RejectAll;

        impl SampleSink for RejectAll {
            fn write_sample(&mut self, _sample: Sample) -> TransportResult<()> {
                Err(TransportError::Rejected("full".into()))
            }
        }

        let file = ivf_file(&[10, 20, 30]);
        let session = CaptureSession::start_with_command(
            cat(&file),
            &StreamConfig::default(),
            RejectAll,
            CancellationToken::new(),
        )
        .unwrap();
        let metrics = session.metrics();
        let outcome = session.wait().await;

        assert_eq!(outcome.reason, StopReason::StreamEnded);
        assert_eq!(outcome.frames_sent, 0);
        assert_eq!(metrics.snapshot().sink_rejections, 3);
    }

    #[tokio::test]
    async fn test_annexb_session_is_paced() {
        let mut data = Vec::new();
        for unit in [
            &[0x67, 0x42, 0x00, 0x1E][..],
            &[0x68, 0xCE, 0x3C, 0x80],
            &[0x65, 0x88, 0x84, 0x01],
            &[0x41, 0x9A, 0x02],
            &[0x41, 0x9A, 0x03],
        ] {
            data.extend_from_slice(&[0, 0, 0, 1]);
            data.extend_from_slice(unit);
        }
        let file = file_with(&data);

        let mut config = StreamConfig::default();
        config.framing = OutputFraming::AnnexB;
        config.settings.frame_rate = 20;

        let (sink, rx) = ChannelSink::bounded(16);
        let started = Instant::now();
        let session =
            CaptureSession::start_with_command(cat(&file), &config, sink, CancellationToken::new())
                .unwrap();
        let outcome = session.wait().await;

        assert_eq!(outcome.reason, StopReason::StreamEnded);
        assert_eq!(outcome.frames_sent, 3);
        assert!(started.elapsed() >= Duration::from_millis(100));

        let samples: Vec<_> = rx.try_iter().collect();
        assert_eq!(samples[0].data.len(), 3 * 4 + 4 + 4 + 4);
        assert_eq!(samples[0].duration, Duration::from_millis(50));
        assert_eq!(samples[1].data.as_ref(), &[0, 0, 0, 1, 0x41, 0x9A, 0x02]);
    }
}
