//! Encoder subprocess lifecycle.
//!
//! The supervisor owns the child process. Its stdout is handed to the caller
//! as the data path; stderr is drained into the log by a background task.
//! A watcher task kills the child when the session token is cancelled.
//! Termination happens exactly once: concurrent callers all wait on the same
//! [`TerminationOutcome`].

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::command::EncoderCommand;
use crate::error::EncoderError;
use crate::EncoderResult;

/// How long to wait for the encoder to exit after it has been killed.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The encoder exited on its own with a success status.
    Completed,

    /// The encoder exited on its own with a failure status.
    ExitedWithError {
        /// Exit code, if the process was not ended by a signal.
        code: Option<i32>,
    },

    /// The encoder was still running and was killed.
    Killed,

    /// The encoder could not be killed or reaped in time.
    Unresponsive {
        /// What went wrong.
        message: String,
    },
}

impl TerminationOutcome {
    /// Returns true if the encoder died without being asked to.
    pub fn is_unexpected_exit(&self) -> bool {
        matches!(self, Self::ExitedWithError { .. })
    }

    /// Human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Self::Completed => "encoder exited cleanly".to_string(),
            Self::ExitedWithError { code: Some(code) } => {
                format!("encoder exited with status {code}")
            }
            Self::ExitedWithError { code: None } => "encoder terminated by signal".to_string(),
            Self::Killed => "encoder killed".to_string(),
            Self::Unresponsive { message } => message.clone(),
        }
    }
}

struct Inner {
    name: String,
    child: Mutex<Option<Child>>,
    outcome: OnceCell<TerminationOutcome>,
    closed: CancellationToken,
    wait_timeout: Duration,
}

impl Inner {
    /// Run `shutdown` once; every caller gets its outcome.
    async fn finish(&self, grace: Option<Duration>) -> TerminationOutcome {
        self.outcome
            .get_or_init(|| async {
                let child = self.child.lock().take();
                let outcome = match child {
                    Some(child) => shutdown(&self.name, child, grace, self.wait_timeout).await,
                    None => TerminationOutcome::Unresponsive {
                        message: "encoder process handle missing".to_string(),
                    },
                };
                self.closed.cancel();
                outcome
            })
            .await
            .clone()
    }
}

/// Owns a running encoder process.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    pid: Option<u32>,
    stderr_task: Option<JoinHandle<()>>,
    watcher_task: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Launch `command` and return its stdout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        command: &EncoderCommand,
        cancel: CancellationToken,
    ) -> EncoderResult<(Self, ChildStdout)> {
        Self::spawn_with_timeout(command, cancel, DEFAULT_WAIT_TIMEOUT)
    }

    /// Launch `command` with a custom post-kill wait timeout.
    #[instrument(skip_all, fields(encoder = %command.name()))]
    pub fn spawn_with_timeout(
        command: &EncoderCommand,
        cancel: CancellationToken,
        wait_timeout: Duration,
    ) -> EncoderResult<(Self, ChildStdout)> {
        let launch_error = |source| EncoderError::Launch {
            program: command.program.clone(),
            source,
        };

        let mut child = command.to_command().spawn().map_err(launch_error)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(missing_pipe("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_error(missing_pipe("stderr")))?;
        let pid = child.id();

        info!(pid = ?pid, args = ?command.args, "Encoder started");

        let inner = Arc::new(Inner {
            name: command.name().to_string(),
            child: Mutex::new(Some(child)),
            outcome: OnceCell::new(),
            closed: CancellationToken::new(),
            wait_timeout,
        });

        let stderr_task = tokio::spawn(drain_stderr(
            inner.name.clone(),
            stderr,
            cancel.clone(),
            inner.closed.clone(),
        ));

        let watcher = Arc::clone(&inner);
        let watcher_task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = watcher.closed.cancelled() => {}
                _ = cancel.cancelled() => {
                    debug!(encoder = %watcher.name, "Session cancelled, terminating encoder");
                    watcher.finish(None).await;
                }
            }
        });

        Ok((
            Self {
                inner,
                pid,
                stderr_task: Some(stderr_task),
                watcher_task: Some(watcher_task),
            },
            stdout,
        ))
    }

    /// OS process id, if the process was still running at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Short encoder name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Outcome, once termination has happened.
    pub fn outcome(&self) -> Option<TerminationOutcome> {
        self.inner.outcome.get().cloned()
    }

    /// Kill the encoder if it is still running and reap it.
    ///
    /// Idempotent: later and concurrent calls return the first outcome.
    pub async fn terminate(&self) -> TerminationOutcome {
        self.inner.finish(None).await
    }

    /// Give the encoder up to the wait timeout to exit on its own, then kill it.
    ///
    /// Used after the data path reaches end of stream.
    pub async fn wait_for_exit(&self) -> TerminationOutcome {
        self.inner.finish(Some(self.inner.wait_timeout)).await
    }

    /// Terminate and wait for the background tasks to finish.
    pub async fn shutdown(mut self) -> TerminationOutcome {
        let outcome = self.terminate().await;
        for task in [self.stderr_task.take(), self.watcher_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                warn!(encoder = %self.inner.name, error = %e, "Encoder task failed");
            }
        }
        outcome
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Lets the watcher exit so the child handle drops and kill_on_drop fires.
        self.inner.closed.cancel();
    }
}

fn missing_pipe(stream: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("{stream} pipe not attached"),
    )
}

async fn drain_stderr(
    name: String,
    stderr: ChildStderr,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => break,
                Ok(_) => {
                    // Device and window names are not always UTF-8.
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        warn!(encoder = %name, "{}", text);
                    }
                }
                Err(e) => {
                    debug!(encoder = %name, error = %e, "Encoder stderr read failed");
                    break;
                }
            },
        }
    }
    debug!(encoder = %name, "Encoder stderr closed");
}

async fn shutdown(
    name: &str,
    mut child: Child,
    grace: Option<Duration>,
    wait_timeout: Duration,
) -> TerminationOutcome {
    if let Some(grace) = grace {
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return exited(name, status);
        }
    }

    match child.try_wait() {
        Ok(Some(status)) => return exited(name, status),
        Ok(None) => {}
        Err(e) => warn!(encoder = %name, error = %e, "Failed to poll encoder status"),
    }

    if let Err(e) = child.start_kill() {
        warn!(encoder = %name, error = %e, "Failed to kill encoder");
    }

    match tokio::time::timeout(wait_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(encoder = %name, %status, "Encoder killed");
            TerminationOutcome::Killed
        }
        Ok(Err(e)) => TerminationOutcome::Unresponsive {
            message: format!("failed to wait for {name}: {e}"),
        },
        Err(_) => {
            warn!(encoder = %name, timeout = ?wait_timeout, "Encoder did not exit after kill");
            TerminationOutcome::Unresponsive {
                message: format!("{name} did not exit within {wait_timeout:?}"),
            }
        }
    }
}

fn exited(name: &str, status: ExitStatus) -> TerminationOutcome {
    if status.success() {
        info!(encoder = %name, "Encoder exited");
        TerminationOutcome::Completed
    } else {
        warn!(encoder = %name, %status, "Encoder exited unexpectedly");
        TerminationOutcome::ExitedWithError {
            code: status.code(),
        }
    }
}
