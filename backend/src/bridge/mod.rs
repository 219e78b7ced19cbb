//! Bridge between tool calls and the external command-line program.
//!
//! An [`Invocation`] owns one running subprocess. Stdout is parsed line by
//! line into domain events that feed the [`Aggregator`] and, when streaming,
//! the [`Notifier`]. Stderr is drained by its own task and joined at the end.
//!
//! Dropping an invocation before it finishes kills the subprocess.

pub mod aggregator;
pub mod invoker;
pub mod models;
pub mod notifier;
pub mod parser;

use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

pub use aggregator::{Aggregator, InvocationResult, Milestone};
pub use invoker::{CommandInvoker, CommandSpec, InvokeError, ProcessInvoker, Termination};
pub use models::{CliModelSource, ModelCache, ModelSource};
pub use notifier::{NotificationSink, Notifier, NotifyError, SseItem, SseSink};
pub use parser::{DomainEvent, Line, LineCodec};

use axum::response::sse::Event;
use invoker::OutputStream;

/// Extra time allowed past the deadline for stdout to close after a kill.
const BACKSTOP_GRACE: Duration = Duration::from_secs(2);

/// How long stderr may keep draining once the process has terminated.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Raw captured output of an invocation.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
}

/// One running subprocess and its output plumbing.
pub struct Invocation {
    stdout: OutputStream,
    stderr_task: JoinHandle<String>,
    completion: JoinHandle<Termination>,
    cancel: CancellationToken,
    backstop: Instant,
    _guard: DropGuard,
}

impl Invocation {
    /// Start the subprocess. Fails before any output exists when the
    /// executable cannot be started.
    pub fn launch(invoker: &dyn CommandInvoker, spec: CommandSpec) -> Result<Self, InvokeError> {
        let cancel = spec.cancel.clone();
        let backstop = Instant::now() + spec.timeout + BACKSTOP_GRACE;
        let running = invoker.launch(spec)?;

        let mut stderr = running.stderr;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                debug!("stderr read ended with error: {}", e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        Ok(Self {
            stdout: running.stdout,
            stderr_task,
            completion: running.completion,
            _guard: cancel.clone().drop_guard(),
            cancel,
            backstop,
        })
    }

    /// Parse stdout to the end, streaming notifications when a notifier is
    /// given, and reconcile the outcome into one result.
    pub async fn run(mut self, mut notifier: Option<&mut Notifier>) -> InvocationResult {
        let stdout = std::mem::replace(&mut self.stdout, Box::new(tokio::io::empty()));
        let mut lines = FramedRead::new(stdout, LineCodec::default());
        let mut aggregator = Aggregator::new();
        let mut events = 0usize;

        while let Some(line) = self
            .next_line(&mut lines, peer_closed(notifier.as_deref()))
            .await
        {
            let Some(event) = parser::classify(line) else {
                continue;
            };
            events += 1;
            let milestone = aggregator.observe(&event);

            if let Some(n) = notifier.as_deref_mut() {
                if let Err(e) = relay(n, &event, milestone.as_ref()).await {
                    debug!("Stopping invocation, notification failed: {}", e);
                    self.cancel.cancel();
                    break;
                }
            }
        }

        let (stderr, termination) = self.finish().await;
        debug!("Invocation finished: {} events, {:?}", events, termination);
        aggregator.finish(stderr, &termination)
    }

    /// Forward stdout lines unchanged as SSE `data` frames.
    pub async fn forward_lines(mut self, tx: &mpsc::Sender<SseItem>) -> RawOutput {
        let stdout = std::mem::replace(&mut self.stdout, Box::new(tokio::io::empty()));
        let mut lines = FramedRead::new(stdout, LineCodec::default());

        while let Some(line) = self.next_line(&mut lines, tx.closed()).await {
            match line {
                Line::Complete(text) if text.trim().is_empty() => {}
                Line::Complete(text) => {
                    if tx.send(Ok(Event::default().data(text))).await.is_err() {
                        self.cancel.cancel();
                        break;
                    }
                }
                Line::Overlong { limit } => {
                    warn!("Skipping stdout line longer than {} bytes", limit)
                }
            }
        }

        let (stderr, termination) = self.finish().await;
        RawOutput {
            stdout: String::new(),
            stderr,
            termination,
        }
    }

    /// Capture stdout verbatim.
    pub async fn collect(mut self) -> RawOutput {
        let mut buf = Vec::new();
        tokio::select! {
            read = self.stdout.read_to_end(&mut buf) => {
                if let Err(e) = read {
                    warn!("Failed to read stdout: {}", e);
                }
            }
            _ = tokio::time::sleep_until(self.backstop) => {
                warn!("stdout still open past the deadline, cancelling");
                self.cancel.cancel();
            }
        }

        let (stderr, termination) = self.finish().await;
        RawOutput {
            stdout: String::from_utf8_lossy(&buf).into_owned(),
            stderr,
            termination,
        }
    }

    async fn next_line<R, F>(
        &mut self,
        lines: &mut FramedRead<R, LineCodec>,
        peer_closed: F,
    ) -> Option<Line>
    where
        R: tokio::io::AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        tokio::select! {
            frame = lines.next() => match frame {
                Some(Ok(line)) => Some(line),
                Some(Err(e)) => {
                    warn!("Failed to read stdout: {}", e);
                    None
                }
                None => None,
            },
            _ = peer_closed => {
                debug!("Peer went away, cancelling invocation");
                self.cancel.cancel();
                None
            }
            _ = tokio::time::sleep_until(self.backstop) => {
                warn!("stdout still open past the deadline, cancelling");
                self.cancel.cancel();
                None
            }
        }
    }

    /// Wait for termination and join the stderr task.
    async fn finish(self) -> (String, Termination) {
        let termination = match self.completion.await {
            Ok(termination) => termination,
            Err(e) => Termination::WaitFailed {
                reason: e.to_string(),
            },
        };

        let abort = self.stderr_task.abort_handle();
        let stderr = match tokio::time::timeout(STDERR_GRACE, self.stderr_task).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("stderr task failed: {}", e);
                String::new()
            }
            Err(_) => {
                warn!("stderr still open after termination, giving up on it");
                abort.abort();
                String::new()
            }
        };

        (stderr, termination)
    }
}

async fn peer_closed(notifier: Option<&Notifier>) {
    match notifier {
        Some(n) => n.closed().await,
        None => std::future::pending().await,
    }
}

async fn relay(
    notifier: &mut Notifier,
    event: &DomainEvent,
    milestone: Option<&Milestone>,
) -> Result<(), NotifyError> {
    notifier.event(event).await?;
    if let Some(m) = milestone {
        notifier.milestone(m).await?;
    }
    Ok(())
}
