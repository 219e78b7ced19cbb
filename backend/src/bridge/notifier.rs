//! Conversion of domain events into MCP notifications written to a sink.

use async_trait::async_trait;
use axum::response::sse::Event;
use opencode_mcp_types::jsonrpc::{self, JsonRpcResponse};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;

use super::aggregator::Milestone;
use super::parser::{DomainEvent, Raw};

/// Logger name carried by `notifications/message`.
const LOGGER: &str = "opencode";

/// Errors raised by a notification sink.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("response stream does not support streaming")]
    StreamingUnsupported,

    #[error("peer closed the stream")]
    Closed,

    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write notification: {0}")]
    Io(#[from] std::io::Error),
}

/// A destination for JSON-RPC messages that flushes each one as it is sent.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Whether the sink can deliver messages before the final response.
    fn supports_streaming(&self) -> bool;

    /// Write one message and flush it.
    async fn send(&mut self, message: &Value) -> Result<(), NotifyError>;

    /// Resolves once the peer has gone away.
    async fn closed(&self);
}

/// Item type of an SSE response body.
pub type SseItem = Result<Event, Infallible>;

/// Sink writing `data: <json>` frames into an SSE response body.
#[derive(Clone)]
pub struct SseSink {
    tx: mpsc::Sender<SseItem>,
}

impl SseSink {
    pub fn new(tx: mpsc::Sender<SseItem>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSink for SseSink {
    fn supports_streaming(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&mut self, message: &Value) -> Result<(), NotifyError> {
        let data = serde_json::to_string(message)?;
        self.tx
            .send(Ok(Event::default().data(data)))
            .await
            .map_err(|_| NotifyError::Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Writes the notification sequence of one invocation.
pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    progress_token: Value,
    progress: u64,
}

impl Notifier {
    /// Fails before anything is written when the sink cannot stream.
    pub fn new(
        sink: Box<dyn NotificationSink>,
        progress_token: Value,
    ) -> Result<Self, NotifyError> {
        if !sink.supports_streaming() {
            return Err(NotifyError::StreamingUnsupported);
        }
        Ok(Self {
            sink,
            progress_token,
            progress: 0,
        })
    }

    /// Emit the notification for one parsed stdout line.
    pub async fn event(&mut self, event: &DomainEvent) -> Result<(), NotifyError> {
        let message = match event {
            DomainEvent::Text { content } => log_message("text", json!(content)),
            DomainEvent::ToolUse(tool) => {
                let mut data = Map::new();
                data.insert("tool".to_string(), json!(tool.tool));
                data.insert("status".to_string(), json!(tool.status.as_str()));
                for (key, field) in [
                    ("input", &tool.input),
                    ("output", &tool.output),
                    ("error", &tool.error),
                ] {
                    if let Some(value) = field {
                        data.insert(key.to_string(), value.clone());
                    }
                }
                log_message("tool_use", Value::Object(data))
            }
            DomainEvent::StepBoundary { phase, reason } => log_message(
                phase.as_str(),
                json!({ "type": phase.as_str(), "reason": reason }),
            ),
            DomainEvent::Unrecognized(Raw::Object(value)) => {
                let kind = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                log_message(&kind, value.clone())
            }
            DomainEvent::Unrecognized(Raw::Line(line)) => {
                self.progress_message(line.clone(), Some(json!({ "raw": line })))
            }
            DomainEvent::Unrecognized(Raw::Overlong { limit }) => self.progress_message(
                format!("line exceeded {} bytes and was skipped", limit),
                None,
            ),
        };
        self.sink.send(&message).await
    }

    /// Emit a progress notification for an aggregator milestone.
    pub async fn milestone(&mut self, milestone: &Milestone) -> Result<(), NotifyError> {
        let message = self.progress_message(milestone.message(), None);
        self.sink.send(&message).await
    }

    /// Emit the terminal response.
    pub async fn finish(&mut self, response: &JsonRpcResponse) -> Result<(), NotifyError> {
        self.sink.send(&response.to_value()).await
    }

    /// Resolves once the peer has gone away.
    pub async fn closed(&self) {
        self.sink.closed().await
    }

    fn progress_message(&mut self, message: String, data: Option<Value>) -> Value {
        self.progress += 1;
        let mut params = json!({
            "progressToken": self.progress_token,
            "progress": self.progress,
            "message": message,
        });
        if let (Some(data), Some(map)) = (data, params.as_object_mut()) {
            map.insert("data".to_string(), data);
        }
        jsonrpc::notification("notifications/progress", params)
    }
}

fn log_message(kind: &str, data: Value) -> Value {
    jsonrpc::notification(
        "notifications/message",
        json!({
            "level": "info",
            "logger": LOGGER,
            "type": kind,
            "data": data,
        }),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bridge::parser::classify_line;
    use std::sync::{Arc, Mutex};

    /// Records every message; optionally refuses to stream.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub messages: Arc<Mutex<Vec<Value>>>,
        pub non_streaming: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn supports_streaming(&self) -> bool {
            !self.non_streaming
        }

        async fn send(&mut self, message: &Value) -> Result<(), NotifyError> {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn closed(&self) {
            std::future::pending::<()>().await
        }
    }

    #[test]
    fn test_non_streaming_sink_is_rejected_before_writing() {
        let sink = RecordingSink {
            non_streaming: true,
            ..Default::default()
        };
        let messages = sink.messages.clone();
        let result = Notifier::new(Box::new(sink), json!(1));
        assert!(matches!(result, Err(NotifyError::StreamingUnsupported)));
        assert!(messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_payloads() {
        let sink = RecordingSink::default();
        let messages = sink.messages.clone();
        let mut notifier = Notifier::new(Box::new(sink), json!("tok")).unwrap();

        for line in [
            r#"{"type":"text","part":{"text":"Hi"}}"#,
            r#"{"type":"tool_use","part":{"tool":"bash","state":{"status":"running","input":{"cmd":"ls"}}}}"#,
            r#"{"type":"step_start","part":{"reason":"plan"}}"#,
            r#"{"type":"session.updated","id":"s"}"#,
            "plain output",
        ] {
            notifier.event(&classify_line(line).unwrap()).await.unwrap();
        }

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 5);

        assert_eq!(messages[0]["method"], "notifications/message");
        assert_eq!(messages[0]["params"]["type"], "text");
        assert_eq!(messages[0]["params"]["data"], "Hi");
        assert_eq!(messages[0]["params"]["logger"], "opencode");

        let tool = &messages[1]["params"]["data"];
        assert_eq!(tool["tool"], "bash");
        assert_eq!(tool["status"], "in_progress");
        assert_eq!(tool["input"]["cmd"], "ls");
        assert!(tool.get("output").is_none());
        assert!(tool.get("error").is_none());

        assert_eq!(messages[2]["params"]["type"], "step_start");
        assert_eq!(messages[2]["params"]["data"]["reason"], "plan");

        assert_eq!(messages[3]["params"]["type"], "session.updated");
        assert_eq!(messages[3]["params"]["data"]["id"], "s");

        assert_eq!(messages[4]["method"], "notifications/progress");
        assert_eq!(messages[4]["params"]["progressToken"], "tok");
        assert_eq!(messages[4]["params"]["progress"], 1);
        assert_eq!(messages[4]["params"]["data"]["raw"], "plain output");
    }

    #[tokio::test]
    async fn test_progress_counter_increases() {
        let sink = RecordingSink::default();
        let messages = sink.messages.clone();
        let mut notifier = Notifier::new(Box::new(sink), json!(9)).unwrap();

        notifier
            .milestone(&Milestone::TextExtended { total_chars: 2 })
            .await
            .unwrap();
        notifier
            .milestone(&Milestone::ToolCompleted {
                tool: "x".to_string(),
            })
            .await
            .unwrap();

        let messages = messages.lock().unwrap();
        assert_eq!(messages[0]["params"]["progress"], 1);
        assert_eq!(messages[1]["params"]["progress"], 2);
        assert_eq!(messages[1]["params"]["message"], "tool x completed");
        assert_eq!(messages[1]["params"]["progressToken"], 9);
    }

    #[tokio::test]
    async fn test_sse_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(4);
        let sink = SseSink::new(tx);
        assert!(sink.supports_streaming());
        drop(rx);
        assert!(!sink.supports_streaming());
        let mut sink = sink;
        assert!(matches!(
            sink.send(&json!({})).await,
            Err(NotifyError::Closed)
        ));
    }
}
