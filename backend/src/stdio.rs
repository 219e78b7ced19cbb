//! Newline-delimited JSON-RPC over stdin/stdout.
//!
//! Requests are handled one at a time. A `tools/call` always streams: its
//! notifications are written as JSON lines ahead of the final response.

use async_trait::async_trait;
use futures::StreamExt;
use opencode_mcp_types::jsonrpc::PARSE_ERROR;
use opencode_mcp_types::JsonRpcResponse;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::bridge::{Line, LineCodec, NotificationSink, Notifier, NotifyError};
use crate::mcp::handler::{decode_request, streaming_unsupported};
use crate::mcp::{Dispatch, McpHandler};
use crate::state::AppState;

/// Upper bound for one request line.
const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Writes each message as one JSON line and flushes it.
pub struct StdioSink<W> {
    writer: Arc<Mutex<W>>,
}

impl<W> StdioSink<W> {
    pub fn new(writer: Arc<Mutex<W>>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> NotificationSink for StdioSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn send(&mut self, message: &Value) -> Result<(), NotifyError> {
        write_line(&self.writer, message).await
    }

    async fn closed(&self) {
        // A closed stdout only surfaces as a failed write.
        std::future::pending::<()>().await
    }
}

async fn write_line<W>(writer: &Mutex<W>, message: &Value) -> Result<(), NotifyError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve requests from `reader` until it reaches end of input.
pub async fn serve<R, W>(state: AppState, reader: R, writer: W) -> Result<(), NotifyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut frames = FramedRead::new(reader, LineCodec::new(MAX_REQUEST_BYTES));
    info!("MCP stdio transport ready");

    while let Some(frame) = frames.next().await {
        let body = match frame? {
            Line::Complete(body) if body.trim().is_empty() => continue,
            Line::Complete(body) => body,
            Line::Overlong { limit } => {
                let response = JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("parse error: request exceeds {} bytes", limit),
                );
                write_line(&writer, &response.to_value()).await?;
                continue;
            }
        };

        let request = match decode_request(body.as_bytes()) {
            Ok(request) => request,
            Err(response) => {
                write_line(&writer, &response.to_value()).await?;
                continue;
            }
        };
        debug!("MCP stdio: method={:?}", request.method);

        match McpHandler::dispatch(&state, request).await {
            Dispatch::Accepted => {}
            Dispatch::Initialized(response, session) => {
                info!("MCP: New session initialized: {}", session.id);
                write_line(&writer, &response.to_value()).await?;
            }
            Dispatch::Respond(response) => write_line(&writer, &response.to_value()).await?,
            Dispatch::Call(call) => {
                let sink = StdioSink::new(writer.clone());
                match Notifier::new(Box::new(sink), call.progress_token()) {
                    Ok(notifier) => call.stream(notifier).await?,
                    Err(e) => {
                        let response = streaming_unsupported(call.id(), &e);
                        write_line(&writer, &response.to_value()).await?;
                    }
                }
            }
        }
    }

    info!("MCP stdio: end of input");
    Ok(())
}
