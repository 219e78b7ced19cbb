//! Event stream parsing for the external program's stdout.
//!
//! Stdout is split into lines by [`LineCodec`] and each line is classified
//! into a [`DomainEvent`]. Lines that are not JSON objects, or objects with
//! an unknown shape, become [`DomainEvent::Unrecognized`] carrying the raw
//! input. Nothing here is fatal to the stream.

use bytes::BytesMut;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::codec::Decoder;

/// Upper bound for a single stdout line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One frame produced by [`LineCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Complete(String),
    /// A line exceeded `limit` bytes; its content was discarded.
    Overlong { limit: usize },
}

/// Newline-delimited decoder with a length bound that reports overlong lines
/// instead of failing the stream.
#[derive(Debug)]
pub struct LineCodec {
    max_len: usize,
    /// Bytes already scanned for a newline in the current buffer.
    next_index: usize,
    /// Discarding the remainder of an overlong line.
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    let _ = buf.split_to(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(Line::Overlong {
                        limit: self.max_len,
                    }));
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    if end > self.max_len {
                        // Drop the line including its newline, then report it.
                        let _ = buf.split_to(end + 1);
                        return Ok(Some(Line::Overlong {
                            limit: self.max_len,
                        }));
                    }
                    let line = buf.split_to(end + 1);
                    let mut bytes = &line[..end];
                    if let Some(stripped) = bytes.strip_suffix(b"\r") {
                        bytes = stripped;
                    }
                    return Ok(Some(Line::Complete(
                        String::from_utf8_lossy(bytes).into_owned(),
                    )));
                }
                (false, None) if buf.len() > self.max_len => {
                    self.discarding = true;
                    buf.clear();
                    self.next_index = 0;
                    continue;
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, std::io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        // A partial line without its terminator is dropped, overlong or not.
        buf.clear();
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

/// State of a tool invocation reported by the external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[serde(alias = "pending", alias = "running")]
    InProgress,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::InProgress => "in_progress",
            ToolStatus::Completed => "completed",
            ToolStatus::Error => "error",
        }
    }
}

/// A tool invocation event.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub tool: String,
    pub status: ToolStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<Value>,
}

/// Which side of a step a boundary marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Start,
    Finish,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Start => "step_start",
            StepPhase::Finish => "step_finish",
        }
    }
}

/// Raw input that could not be classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Raw {
    /// A line that is not a JSON object.
    Line(String),
    /// A JSON object without a recognizable `type`.
    Object(Value),
    /// A line longer than the limit; content discarded.
    Overlong { limit: usize },
}

/// One classified unit decoded from one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Text { content: String },
    ToolUse(ToolUse),
    StepBoundary { phase: StepPhase, reason: String },
    Unrecognized(Raw),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Text { part: TextPart },
    ToolUse { part: ToolPart },
    StepStart { #[serde(default)] part: StepPart },
    StepFinish { #[serde(default)] part: StepPart },
}

#[derive(Deserialize)]
struct TextPart {
    text: String,
}

#[derive(Deserialize)]
struct ToolPart {
    tool: String,
    state: ToolState,
}

#[derive(Deserialize)]
struct ToolState {
    status: ToolStatus,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize, Default)]
struct StepPart {
    #[serde(default)]
    reason: Option<String>,
}

impl From<WireEvent> for DomainEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Text { part } => DomainEvent::Text { content: part.text },
            WireEvent::ToolUse { part } => DomainEvent::ToolUse(ToolUse {
                tool: part.tool,
                status: part.state.status,
                input: part.state.input.filter(|v| !v.is_null()),
                output: part.state.output.filter(|v| !v.is_null()),
                error: part.state.error.filter(|v| !v.is_null()),
            }),
            WireEvent::StepStart { part } => DomainEvent::StepBoundary {
                phase: StepPhase::Start,
                reason: part.reason.unwrap_or_default(),
            },
            WireEvent::StepFinish { part } => DomainEvent::StepBoundary {
                phase: StepPhase::Finish,
                reason: part.reason.unwrap_or_default(),
            },
        }
    }
}

/// Classify one stdout line. Blank lines yield `None`.
pub fn classify_line(line: &str) -> Option<DomainEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => value,
        _ => return Some(DomainEvent::Unrecognized(Raw::Line(line.to_string()))),
    };

    Some(match WireEvent::deserialize(&value) {
        Ok(wire) => wire.into(),
        Err(_) => DomainEvent::Unrecognized(Raw::Object(value)),
    })
}

/// Classify a codec frame.
pub fn classify(line: Line) -> Option<DomainEvent> {
    match line {
        Line::Complete(text) => classify_line(&text),
        Line::Overlong { limit } => Some(DomainEvent::Unrecognized(Raw::Overlong { limit })),
    }
}
