//! Main engine orchestrator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use relay_encoder::EncoderCommand;
use relay_ipc::{EngineCommand, EngineEvent, EngineState, StopReason, StreamConfig};
use relay_transport::SampleSink;

use crate::error::EngineError;
use crate::session::{CaptureSession, SessionOutcome};
use crate::EngineResult;

/// How often the command loop wakes up without a command.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often metrics are published while live.
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Builds the sink for a new session.
pub type SinkFactory = Box<dyn FnMut(&StreamConfig) -> Box<dyn SampleSink> + Send>;

/// Builds the encoder command for a new session.
pub type CommandBuilder = Box<dyn Fn(&StreamConfig) -> EncoderCommand + Send>;

/// The relay engine.
///
/// Owns a tokio runtime for the capture pipeline and is driven by
/// [`EngineCommand`]s from a blocking loop on the caller's thread.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    state: Arc<RwLock<EngineState>>,
    runtime: Runtime,
    sink_factory: SinkFactory,
    command_builder: CommandBuilder,
    session: Option<CaptureSession>,
    shutdown: CancellationToken,
    last_metrics: Instant,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        sink_factory: SinkFactory,
    ) -> EngineResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("relay-capture")
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;

        Ok(Self {
            command_rx,
            event_tx,
            state: Arc::new(RwLock::new(EngineState::Idle)),
            runtime,
            sink_factory,
            command_builder: Box::new(EncoderCommand::from_config),
            session: None,
            shutdown: CancellationToken::new(),
            last_metrics: Instant::now(),
        })
    }

    /// Replace how the encoder command is derived from the configuration.
    pub fn with_command_builder(mut self, builder: CommandBuilder) -> Self {
        self.command_builder = builder;
        self
    }

    /// Shared handle to the current state.
    pub fn state(&self) -> Arc<RwLock<EngineState>> {
        Arc::clone(&self.state)
    }

    /// Run the engine (blocking).
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");
        self.send_event(EngineEvent::Ready);

        loop {
            match self.command_rx.recv_timeout(POLL_INTERVAL) {
                Ok(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                    self.tick();
                }
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Command channel disconnected, shutting down");
                    self.stop_stream(StopReason::Shutdown);
                    break;
                }
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::Start { config } => self.start_stream(config),
            EngineCommand::Stop => self.stop_stream(StopReason::UserRequested),
            EngineCommand::TransportClosed => self.stop_stream(StopReason::TransportClosed),
            EngineCommand::GetState => self.send_state(),
            EngineCommand::Shutdown => {
                self.stop_stream(StopReason::Shutdown);
                self.send_event(EngineEvent::Shutdown);
                return false;
            }
        }

        true
    }

    fn tick(&mut self) {
        if self.session.as_ref().is_some_and(CaptureSession::is_finished) {
            self.finish_session(None);
            return;
        }

        if self.state.read().is_live() && self.last_metrics.elapsed() >= METRICS_INTERVAL {
            self.emit_metrics();
        }
    }

    /// Start a capture session.
    #[instrument(name = "start_stream", skip(self, config))]
    fn start_stream(&mut self, config: StreamConfig) {
        // Idempotent: ignore if already starting or live
        {
            let state = self.state.read();
            if state.is_starting() || state.is_live() {
                debug!("Already starting or live, ignoring start command");
                return;
            }
        }

        info!(framing = config.framing.name(), "Starting stream");
        self.transition_to(EngineState::Starting);

        let sink = (self.sink_factory)(&config);
        let command = (self.command_builder)(&config);
        let cancel = self.shutdown.child_token();

        let started = {
            let _guard = self.runtime.enter();
            CaptureSession::start_with_command(command, &config, sink, cancel)
        };

        match started {
            Ok(session) => {
                self.session = Some(session);
                self.last_metrics = Instant::now();
                self.transition_to(EngineState::Live {
                    config,
                    metrics: Default::default(),
                });
                info!("Stream started successfully");
            }
            Err(e) => {
                error!(error = %e, "Stream start failed");
                let message = e.to_string();
                self.send_event(EngineEvent::Error {
                    recoverable: true,
                    message: message.clone(),
                });
                self.transition_to(EngineState::Error {
                    message,
                    recoverable: true,
                });
            }
        }
    }

    /// Stop the current session.
    #[instrument(name = "stop_stream", skip(self))]
    fn stop_stream(&mut self, reason: StopReason) {
        // Idempotent: ignore if nothing is running
        if self.session.is_none() {
            debug!("No active session, ignoring stop");
            return;
        }

        info!(?reason, "Stopping stream");
        self.finish_session(Some(reason));
    }

    /// Tear down the current session and settle the state.
    ///
    /// `requested` is `None` when the pipeline ended on its own.
    fn finish_session(&mut self, requested: Option<StopReason>) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Some(reason) = &requested {
            self.transition_to(EngineState::Stopping {
                reason: reason.clone(),
            });
            session.stop(reason.clone());
        }

        let outcome = self.runtime.block_on(session.wait());

        if requested.is_none() {
            self.transition_to(EngineState::Stopping {
                reason: outcome.reason.clone(),
            });
        }

        self.settle(outcome);
    }

    fn settle(&self, outcome: SessionOutcome) {
        let SessionOutcome {
            reason,
            frames_sent,
            termination,
        } = outcome;

        if let Some(termination) = &termination {
            debug!(termination = %termination.describe(), "Encoder terminated");
        }

        self.send_event(EngineEvent::SessionEnded {
            reason: reason.clone(),
            frames_sent,
        });

        if reason.is_failure() {
            let message = reason.message();
            warn!(%message, "Session failed");
            self.send_event(EngineEvent::Error {
                recoverable: true,
                message: message.clone(),
            });
            self.transition_to(EngineState::Error {
                message,
                recoverable: true,
            });
        } else {
            self.transition_to(EngineState::Idle);
        }

        info!(frames_sent, "Stream stopped");
    }

    fn send_state(&self) {
        let state = self.state.read().clone();
        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn emit_metrics(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let collector = session.metrics();
        let metrics = collector.snapshot();

        if let EngineState::Live { metrics: live, .. } = &mut *self.state.write() {
            *live = metrics.clone();
        }
        self.send_event(EngineEvent::Metrics(metrics));

        for warning in collector.check_warnings() {
            self.send_event(EngineEvent::PerformanceWarning(warning));
        }

        collector.mark_reported();
        self.last_metrics = Instant::now();
    }

    fn transition_to(&self, new_state: EngineState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(session) = self.session.take() {
            self.runtime.block_on(session.wait());
        }
    }
}
