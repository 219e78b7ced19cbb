//! Subprocess launching and supervision.
//!
//! A [`CommandInvoker`] starts one OS process per call and hands back its
//! stdout and stderr as independent readers plus a completion handle. The
//! supervisor task owns the child and is the only place that kills it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised before any stream is produced.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("executable is not runnable: {program}")]
    NotExecutable { program: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything needed to start one subprocess.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Cancelling this token kills the process.
    pub cancel: CancellationToken,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: None,
            cwd: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin.filter(|s| !s.is_empty());
        self
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited on its own with a status code.
    Exited { code: i32 },
    /// The process was terminated by a signal it did not get from us.
    Signalled,
    /// The deadline elapsed and the process was killed.
    TimedOut { after: Duration },
    /// The caller went away and the process was killed.
    Cancelled,
    /// Waiting on the process failed.
    WaitFailed { reason: String },
}

impl Termination {
    /// Exit code reported to callers; `-1` when the process did not exit normally.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited { code } => *code,
            _ => -1,
        }
    }

    /// Whether the invocation counts as failed.
    pub fn failed(&self) -> bool {
        !matches!(self, Termination::Exited { code: 0 })
    }

    /// The termination error, if the process did not exit normally.
    pub fn error(&self) -> Option<String> {
        match self {
            Termination::Exited { .. } => None,
            Termination::Signalled => Some("process terminated by signal".to_string()),
            Termination::TimedOut { after } => {
                Some(format!("timed out after {:?}", after))
            }
            Termination::Cancelled => Some("cancelled".to_string()),
            Termination::WaitFailed { reason } => Some(format!("wait failed: {}", reason)),
        }
    }
}

/// Reader half handed out for stdout/stderr.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A started subprocess.
pub struct RunningCommand {
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    /// Resolves once the process has fully terminated.
    pub completion: JoinHandle<Termination>,
}

/// Launches external processes.
pub trait CommandInvoker: Send + Sync {
    fn launch(&self, spec: CommandSpec) -> Result<RunningCommand, InvokeError>;
}

/// [`CommandInvoker`] backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

impl CommandInvoker for ProcessInvoker {
    fn launch(&self, spec: CommandSpec) -> Result<RunningCommand, InvokeError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| match source.kind() {
            ErrorKind::NotFound => InvokeError::NotFound {
                program: spec.program.clone(),
            },
            ErrorKind::PermissionDenied => InvokeError::NotExecutable {
                program: spec.program.clone(),
            },
            _ => InvokeError::Spawn {
                program: spec.program.clone(),
                source,
            },
        })?;
        debug!(
            "Spawned {} {:?} (pid {:?})",
            spec.program,
            spec.args,
            child.id()
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(InvokeError::Spawn {
                program: spec.program,
                source: std::io::Error::other("stdio pipes unavailable"),
            });
        };

        if let (Some(text), Some(mut pipe)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(text.as_bytes()).await {
                    if e.kind() != ErrorKind::BrokenPipe {
                        warn!("Failed to write stdin: {}", e);
                    }
                }
                // Dropping the pipe closes the child's stdin.
            });
        }

        let timeout = spec.timeout;
        let cancel = spec.cancel;
        let completion = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => match status.code() {
                        Some(code) => Termination::Exited { code },
                        None => Termination::Signalled,
                    },
                    Err(e) => Termination::WaitFailed { reason: e.to_string() },
                },
                _ = tokio::time::sleep(timeout) => {
                    warn!("Process exceeded {}s deadline, killing", timeout.as_secs());
                    kill(&mut child).await;
                    Termination::TimedOut { after: timeout }
                }
                _ = cancel.cancelled() => {
                    debug!("Invocation cancelled, killing process");
                    kill(&mut child).await;
                    Termination::Cancelled
                }
            }
        });

        Ok(RunningCommand {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            completion,
        })
    }
}

async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill process: {}", e);
    }
}
