//! Tool catalog and tool call validation.
//!
//! A `tools/call` is turned into a [`ToolCommand`] only after every check has
//! passed, so nothing invalid ever reaches the invoker.

use opencode_mcp_types::jsonrpc::INVALID_PARAMS;
use opencode_mcp_types::{ExecRequest, ToolCallParams, ToolDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Tools exposed through `tools/list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Run,
    Exec,
    Models,
    SessionList,
    AgentList,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Exec,
        Tool::Run,
        Tool::Models,
        Tool::SessionList,
        Tool::AgentList,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Run => "opencode_run",
            Tool::Exec => "opencode_exec",
            Tool::Models => "opencode_models",
            Tool::SessionList => "opencode_session_list",
            Tool::AgentList => "opencode_agent_list",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    fn description(&self) -> &'static str {
        match self {
            Tool::Run => "Run AI code assistant with a message. This is the main tool for code editing, analysis, and generation.",
            Tool::Exec => "Run any opencode-cli command with custom arguments. Use this for advanced operations.",
            Tool::Models => "List all available AI models",
            Tool::SessionList => "List all saved sessions",
            Tool::AgentList => "List all available agents",
        }
    }

    fn input_schema(&self) -> Value {
        match self {
            Tool::Run => json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message/prompt to send to the AI assistant"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Project directory to work in"
                    },
                    "model": {
                        "type": "string",
                        "description": "Model to use (e.g., 'github-copilot/claude-sonnet-4')"
                    },
                    "session": {
                        "type": "string",
                        "description": "Session ID to continue a previous conversation"
                    },
                    "continue": {
                        "type": "boolean",
                        "description": "Continue the last session"
                    },
                    "files": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "File paths to attach to the message for context (relative to cwd or absolute)"
                    }
                },
                "required": ["message"]
            }),
            Tool::Exec => json!({
                "type": "object",
                "properties": {
                    "args": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Command arguments (e.g., ['run', '--model', 'gpt-4', 'Hello'])"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory for the command"
                    },
                    "stdin": {
                        "type": "string",
                        "description": "Standard input to pass to the command"
                    }
                },
                "required": ["args"]
            }),
            Tool::Models | Tool::SessionList | Tool::AgentList => json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// The `tools/list` catalog.
pub fn catalog() -> Vec<ToolDescriptor> {
    Tool::ALL.iter().map(Tool::descriptor).collect()
}

/// Reasons a tool call is rejected before anything is launched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ToolCallError {
    #[error("invalid params")]
    InvalidParams,

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments")]
    InvalidArguments,

    #[error("missing message")]
    MissingMessage,

    #[error("missing args")]
    MissingArgs,

    #[error("invalid cwd: {0}")]
    InvalidCwd(String),
}

impl ToolCallError {
    /// JSON-RPC error code for this rejection.
    pub fn code(&self) -> i32 {
        INVALID_PARAMS
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RunArgs {
    #[serde(default)]
    message: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default, rename = "continue")]
    continue_last: bool,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Clone)]
enum CommandArgs {
    Run(RunArgs),
    Fixed(Vec<String>),
}

/// A validated tool call, ready to be turned into a command.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub tool: Tool,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    args: CommandArgs,
}

impl ToolCommand {
    /// Decode the raw `tools/call` params.
    pub fn parse_params(params: Option<&Value>) -> Result<ToolCallParams, ToolCallError> {
        params
            .cloned()
            .ok_or(ToolCallError::InvalidParams)
            .and_then(|p| serde_json::from_value(p).map_err(|_| ToolCallError::InvalidParams))
    }

    /// Validate a tool call. `request_cwd` is the envelope-level working
    /// directory used when the arguments carry none.
    pub fn from_params(
        params: &ToolCallParams,
        request_cwd: Option<&str>,
    ) -> Result<Self, ToolCallError> {
        let tool = Tool::from_name(&params.name)
            .ok_or_else(|| ToolCallError::UnknownTool(params.name.clone()))?;
        let arguments = match params.arguments {
            None | Some(Value::Null) => json!({}),
            Some(ref value) => value.clone(),
        };

        let (cwd, stdin, args) = match tool {
            Tool::Run => {
                let run: RunArgs = decode(arguments)?;
                if run.message.is_empty() {
                    return Err(ToolCallError::MissingMessage);
                }
                (run.cwd.clone(), None, CommandArgs::Run(run))
            }
            Tool::Exec => {
                let exec: ExecRequest = decode(arguments)?;
                if exec.args.is_empty() {
                    return Err(ToolCallError::MissingArgs);
                }
                (exec.cwd, exec.stdin, CommandArgs::Fixed(exec.args))
            }
            Tool::Models | Tool::SessionList | Tool::AgentList => {
                let list: ListArgs = decode(arguments)?;
                let argv = match tool {
                    Tool::Models => vec!["models"],
                    Tool::SessionList => vec!["session", "list"],
                    _ => vec!["agent", "list"],
                };
                (
                    list.cwd,
                    None,
                    CommandArgs::Fixed(argv.into_iter().map(str::to_string).collect()),
                )
            }
        };

        let cwd = cwd
            .filter(|c| !c.is_empty())
            .or_else(|| request_cwd.filter(|c| !c.is_empty()).map(str::to_string));
        let cwd = validate_cwd(cwd.as_deref())?;

        Ok(Self {
            tool,
            cwd,
            stdin,
            args,
        })
    }

    /// Whether the command still needs a model chosen for it.
    pub fn needs_default_model(&self) -> bool {
        match &self.args {
            CommandArgs::Run(run) => run.model.as_deref().unwrap_or("").is_empty(),
            CommandArgs::Fixed(_) => false,
        }
    }

    /// The argument vector, using `default_model` when a run names no model.
    pub fn argv(&self, default_model: &str) -> Vec<String> {
        match &self.args {
            CommandArgs::Fixed(args) => args.clone(),
            CommandArgs::Run(run) => {
                let model = run
                    .model
                    .as_deref()
                    .filter(|m| !m.is_empty())
                    .unwrap_or(default_model);
                let mut argv: Vec<String> = ["run", "--format", "json", "--model", model]
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if let Some(session) = run.session.as_deref().filter(|s| !s.is_empty()) {
                    argv.push("--session".to_string());
                    argv.push(session.to_string());
                }
                if run.continue_last {
                    argv.push("--continue".to_string());
                }
                for file in &run.files {
                    argv.push("--file".to_string());
                    argv.push(file.clone());
                }
                argv.push(run.message.clone());
                argv
            }
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolCallError> {
    serde_json::from_value(arguments).map_err(|_| ToolCallError::InvalidArguments)
}

/// An absent directory is fine; a given one must exist and be a directory.
pub fn validate_cwd(cwd: Option<&str>) -> Result<Option<PathBuf>, ToolCallError> {
    let Some(cwd) = cwd.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    match std::fs::metadata(cwd) {
        Ok(meta) if meta.is_dir() => Ok(Some(PathBuf::from(cwd))),
        Ok(_) => Err(ToolCallError::InvalidCwd("not a directory".to_string())),
        Err(e) => Err(ToolCallError::InvalidCwd(e.to_string())),
    }
}
