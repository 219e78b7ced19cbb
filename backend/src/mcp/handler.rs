//! MCP JSON-RPC request handler.
//!
//! Transport-independent dispatch shared by the HTTP endpoint and the stdio
//! transport. A `tools/call` that passes validation is launched here and
//! handed back as a [`PendingCall`]; the transport decides whether to
//! aggregate it or stream it.

use opencode_mcp_types::jsonrpc::{
    INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, SERVER_ERROR,
};
use opencode_mcp_types::{JsonRpcRequest, JsonRpcResponse, ToolCallResult};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::session::Session;
use super::tools::{self, Tool, ToolCommand};
use crate::bridge::{CommandSpec, Invocation, InvocationResult, Notifier, NotifyError};
use crate::state::AppState;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Server identity reported by `initialize`.
pub const SERVER_NAME: &str = "opencode-mcp";

/// Outcome of dispatching one message.
pub enum Dispatch {
    /// Notification; nothing to send back.
    Accepted,
    /// A complete response.
    Respond(JsonRpcResponse),
    /// Handshake response plus the session it created.
    Initialized(JsonRpcResponse, Session),
    /// A launched tool call waiting to be driven.
    Call(PendingCall),
}

/// A validated and launched `tools/call`.
pub struct PendingCall {
    id: Option<Value>,
    tool: Tool,
    progress_token: Value,
    invocation: Invocation,
}

impl PendingCall {
    pub fn id(&self) -> Option<Value> {
        self.id.clone()
    }

    /// Token for `notifications/progress`.
    pub fn progress_token(&self) -> Value {
        self.progress_token.clone()
    }

    /// Wait for the subprocess and return one aggregated response.
    pub async fn aggregate(self) -> JsonRpcResponse {
        let result = self.invocation.run(None).await;
        tool_response(self.id, self.tool, result)
    }

    /// Stream notifications while the subprocess runs, then write the
    /// terminal response as the last message.
    pub async fn stream(self, mut notifier: Notifier) -> Result<(), NotifyError> {
        let result = self.invocation.run(Some(&mut notifier)).await;
        let response = tool_response(self.id, self.tool, result);
        notifier.finish(&response).await
    }
}

/// MCP request handler.
pub struct McpHandler;

impl McpHandler {
    /// Dispatch one decoded JSON-RPC message.
    pub async fn dispatch(state: &AppState, request: JsonRpcRequest) -> Dispatch {
        let id = request.id.clone();
        let Some(method) = request.method.as_deref() else {
            return Dispatch::Respond(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "invalid request: missing method",
            ));
        };

        if request.is_notification() {
            debug!("MCP: Notification {}", method);
            return Dispatch::Accepted;
        }
        debug!("MCP: Handling method: {}", method);

        match method {
            "initialize" => {
                let session = state.sessions().create().await;
                Dispatch::Initialized(Self::handle_initialize(id), session)
            }
            "ping" => Dispatch::Respond(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => Dispatch::Respond(JsonRpcResponse::success(
                id,
                json!({ "tools": tools::catalog() }),
            )),
            "tools/call" => Self::handle_call_tool(state, &request).await,
            other => Dispatch::Respond(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            )),
        }
    }

    fn handle_initialize(id: Option<Value>) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    async fn handle_call_tool(state: &AppState, request: &JsonRpcRequest) -> Dispatch {
        let id = request.id.clone();
        let parsed = ToolCommand::parse_params(request.params.as_ref()).and_then(|params| {
            ToolCommand::from_params(&params, request.cwd.as_deref()).map(|c| (params, c))
        });
        let (params, command) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("MCP: Rejected tool call: {}", e);
                return Dispatch::Respond(JsonRpcResponse::error(id, e.code(), e.to_string()));
            }
        };

        let default_model = if command.needs_default_model() {
            let model = state.default_model().await;
            info!("Using default model: {}", model);
            model
        } else {
            String::new()
        };

        let config = state.config();
        let argv = command.argv(&default_model);
        info!("MCP: {} -> {} {:?}", command.tool.name(), config.target, argv);

        let spec = CommandSpec::new(&config.target, argv, config.timeout)
            .with_cwd(command.cwd.clone())
            .with_stdin(command.stdin.clone());
        let invocation = match Invocation::launch(state.invoker(), spec) {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("MCP: Failed to launch {}: {}", config.target, e);
                return Dispatch::Respond(JsonRpcResponse::error(
                    id,
                    INTERNAL_ERROR,
                    e.to_string(),
                ));
            }
        };

        Dispatch::Call(PendingCall {
            progress_token: params
                .progress_token()
                .or_else(|| id.clone())
                .unwrap_or(Value::Null),
            id,
            tool: command.tool,
            invocation,
        })
    }
}

/// Decode a request body, distinguishing unparseable JSON from a
/// well-formed value that is not a request.
#[allow(clippy::result_large_err)]
pub fn decode_request(body: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| JsonRpcResponse::error(None, PARSE_ERROR, format!("parse error: {}", e)))?;
    let id = value.get("id").cloned().filter(|id| !id.is_null());
    if !value.is_object() {
        return Err(JsonRpcResponse::error(
            None,
            INVALID_REQUEST,
            "invalid request: expected an object",
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| JsonRpcResponse::error(id, INVALID_REQUEST, format!("invalid request: {}", e)))
}

/// Error response for a sink that cannot stream.
pub fn streaming_unsupported(id: Option<Value>, e: &NotifyError) -> JsonRpcResponse {
    JsonRpcResponse::error(id, SERVER_ERROR, e.to_string())
}

fn tool_response(id: Option<Value>, tool: Tool, result: InvocationResult) -> JsonRpcResponse {
    if result.failed {
        info!(
            "MCP: {} failed (exit code {})",
            tool.name(),
            result.exit_code
        );
    } else {
        debug!("MCP: {} completed", tool.name());
    }
    let result: ToolCallResult = result.into_tool_result();
    match serde_json::to_value(&result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}
