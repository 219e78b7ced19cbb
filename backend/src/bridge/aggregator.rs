//! Accumulation of domain events into one final result.

use opencode_mcp_types::{ToolCallResult, ToolContent};
use serde_json::Value;

use super::invoker::Termination;
use super::parser::{DomainEvent, Raw, StepPhase, ToolStatus};

/// A notable change in the aggregate, reported as a progress notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Milestone {
    TextExtended { total_chars: usize },
    ToolCompleted { tool: String },
    Step { phase: StepPhase, reason: String },
}

impl Milestone {
    pub fn message(&self) -> String {
        match self {
            Milestone::TextExtended { total_chars } => {
                format!("received text ({} chars)", total_chars)
            }
            Milestone::ToolCompleted { tool } => format!("tool {} completed", tool),
            Milestone::Step { phase, reason } if reason.is_empty() => {
                phase.as_str().to_string()
            }
            Milestone::Step { phase, reason } => format!("{}: {}", phase.as_str(), reason),
        }
    }
}

/// One labelled tool output block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub tool: String,
    pub output: String,
}

/// Collects text fragments, completed tool outputs and raw lines.
#[derive(Debug, Default)]
pub struct Aggregator {
    text: String,
    tool_outputs: Vec<ToolOutput>,
    raw_lines: Vec<String>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the aggregate.
    pub fn observe(&mut self, event: &DomainEvent) -> Option<Milestone> {
        match event {
            DomainEvent::Text { content } => {
                if content.is_empty() {
                    return None;
                }
                self.text.push_str(content);
                Some(Milestone::TextExtended {
                    total_chars: self.text.chars().count(),
                })
            }
            DomainEvent::ToolUse(tool) if tool.status == ToolStatus::Completed => {
                match tool.output.as_ref() {
                    Some(Value::String(output)) if !output.is_empty() => {
                        self.tool_outputs.push(ToolOutput {
                            tool: tool.tool.clone(),
                            output: output.clone(),
                        });
                    }
                    _ => {}
                }
                Some(Milestone::ToolCompleted {
                    tool: tool.tool.clone(),
                })
            }
            DomainEvent::ToolUse(_) => None,
            DomainEvent::StepBoundary { phase, reason } => Some(Milestone::Step {
                phase: *phase,
                reason: reason.clone(),
            }),
            DomainEvent::Unrecognized(Raw::Line(line)) => {
                self.raw_lines.push(line.clone());
                None
            }
            DomainEvent::Unrecognized(Raw::Object(value)) => {
                self.raw_lines.push(value.to_string());
                None
            }
            DomainEvent::Unrecognized(Raw::Overlong { .. }) => None,
        }
    }

    /// Combine the aggregate with the captured stderr and exit status.
    pub fn finish(self, stderr: String, termination: &Termination) -> InvocationResult {
        let aggregated_text = if self.text.is_empty() && self.tool_outputs.is_empty() {
            self.raw_lines.join("\n")
        } else {
            self.text
        };

        InvocationResult {
            aggregated_text,
            tool_outputs: self.tool_outputs,
            stderr_text: stderr,
            exit_code: termination.exit_code(),
            failed: termination.failed(),
            note: match termination {
                Termination::Exited { .. } => None,
                other => other.error(),
            },
        }
    }
}

/// Final outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub aggregated_text: String,
    pub tool_outputs: Vec<ToolOutput>,
    pub stderr_text: String,
    pub exit_code: i32,
    pub failed: bool,
    /// Why the process did not exit on its own (timeout, cancellation, ...).
    pub note: Option<String>,
}

impl InvocationResult {
    /// Render the final text.
    ///
    /// Layout: the aggregated text, then a `--- Tool Outputs ---` section,
    /// then `[stderr]`, then the termination note and `[exit code: N]` when
    /// the code is non-zero. Sections that are empty are omitted.
    pub fn compose(&self) -> String {
        let mut out = self.aggregated_text.clone();

        if !self.tool_outputs.is_empty() {
            out.push_str("\n\n--- Tool Outputs ---\n");
            let blocks: Vec<String> = self
                .tool_outputs
                .iter()
                .map(|t| format!("[Tool: {}]\n{}", t.tool, t.output))
                .collect();
            out.push_str(&blocks.join("\n\n"));
        }

        let stderr = self.stderr_text.trim_end();
        if !stderr.is_empty() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str("[stderr]\n");
            out.push_str(stderr);
        }

        if let Some(ref note) = self.note {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]", note));
        }

        if self.exit_code != 0 {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[exit code: {}]", self.exit_code));
        }

        out
    }

    /// The MCP `tools/call` result for this invocation.
    pub fn into_tool_result(self) -> ToolCallResult {
        ToolCallResult {
            content: vec![ToolContent::text(self.compose())],
            is_error: self.failed,
        }
    }
}
