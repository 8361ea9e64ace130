//! screenrelay: capture the desktop through ffmpeg and relay encoded frames.

mod cli;
mod sink;

use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_engine::{create_engine, SinkFactory};
use relay_ipc::{command_channel, event_channel, EngineCommand, EngineEvent, StopReason};
use relay_transport::SampleSink;

use crate::cli::Cli;

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "screenrelay=debug,relay_engine=debug,relay_capture=info,relay_encoder=info,relay_transport=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// How the single session run by the CLI ended.
enum RunEnd {
    Session { reason: StopReason, frames_sent: u64 },
    StartFailed(String),
    EngineGone,
}

/// Follow engine events until the session is over.
fn watch_events(events: Receiver<EngineEvent>) -> RunEnd {
    for event in events.iter() {
        match event {
            EngineEvent::StateChanged { current, .. } => {
                debug!(state = current.name(), "Engine state");
            }
            EngineEvent::Metrics(metrics) => {
                debug!(
                    fps = format!("{:.1}", metrics.fps),
                    bitrate_kbps = metrics.bitrate_kbps,
                    frames = metrics.frames_sent,
                    "Metrics"
                );
            }
            EngineEvent::PerformanceWarning(warning) => warn!(?warning, "Performance warning"),
            EngineEvent::SessionEnded {
                reason,
                frames_sent,
            } => return RunEnd::Session {
                reason,
                frames_sent,
            },
            EngineEvent::Error { message, .. } => return RunEnd::StartFailed(message),
            EngineEvent::Ready => debug!("Engine ready"),
            EngineEvent::Shutdown => return RunEnd::EngineGone,
        }
    }
    RunEnd::EngineGone
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = cli.stream_config()?;
    let output = sink::open(cli.output.as_deref()).context("failed to open output")?;

    info!(
        framing = config.framing.name(),
        fps = config.settings.frame_rate,
        bitrate_kbps = config.settings.bitrate_kbps,
        "Starting screenrelay"
    );

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let mut output = Some(output);
    let factory: SinkFactory = Box::new(move |_| -> Box<dyn SampleSink> {
        output.take().unwrap_or_else(|| Box::new(sink::NullSink))
    });
    let mut engine = create_engine(command_rx, event_tx, factory)?;

    let engine_thread = thread::Builder::new()
        .name("relay-engine".into())
        .spawn(move || {
            info!("Engine thread starting");
            engine.run();
            info!("Engine thread stopped");
        })
        .context("failed to spawn engine thread")?;

    command_tx.send(EngineCommand::Start { config })?;

    let mut watcher = tokio::task::spawn_blocking(move || watch_events(event_rx));
    let limit = cli.run_duration();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let end = tokio::select! {
        end = &mut watcher => Some(end?),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping capture");
            None
        }
        _ = deadline => {
            info!(limit = ?limit, "Duration reached, stopping capture");
            None
        }
    };

    let end = match end {
        Some(end) => end,
        None => {
            command_tx.send(EngineCommand::Stop)?;
            watcher.await?
        }
    };

    if command_tx.send(EngineCommand::Shutdown).is_err() {
        debug!("Engine already gone");
    }
    if engine_thread.join().is_err() {
        error!("Engine thread panicked");
    }

    match end {
        RunEnd::Session {
            reason,
            frames_sent,
        } => {
            info!(frames_sent, reason = %reason.message(), "Capture finished");
            if reason.is_failure() {
                return Err(anyhow!(reason.message()));
            }
            Ok(())
        }
        RunEnd::StartFailed(message) => Err(anyhow!(message)),
        RunEnd::EngineGone => Err(anyhow!("engine stopped unexpectedly")),
    }
}
