//! Wire types shared by the opencode MCP bridge and its clients.
//!
//! This crate contains the JSON-RPC envelopes, MCP tool descriptors and the
//! request/response shapes of the direct execution endpoints.

/// Default address the bridge listens on (Go-style `:port` is accepted).
pub const DEFAULT_ADDR: &str = ":9876";

/// Default external executable driven by the bridge.
pub const DEFAULT_TARGET: &str = "opencode-cli";

/// Default lifetime of a single subprocess invocation, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Fallback model when none can be discovered from the executable.
pub const DEFAULT_MODEL: &str = "github-copilot/gpt-5.2-codex";

pub mod exec;
pub mod jsonrpc;
pub mod tools;

pub use exec::{ExecRequest, ExecResponse};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use tools::{ToolCallParams, ToolCallResult, ToolContent, ToolDescriptor};
