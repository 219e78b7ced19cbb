//! MCP (Model Context Protocol) support.
//!
//! Implements the JSON-RPC methods of the MCP 2025-03-26 transport that the
//! bridge needs: `initialize`, `ping`, `tools/list` and `tools/call`.
//!
//! ## Session Management
//!
//! Sessions are identified by the `Mcp-Session-Id` header, assigned during
//! initialization. A missing or unknown id never blocks a request.

pub mod handler;
pub mod session;
pub mod tools;

pub use handler::{Dispatch, McpHandler, PendingCall};
pub use session::{Session, SessionRegistry};
