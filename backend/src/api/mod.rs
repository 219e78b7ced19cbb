//! API handlers.

pub mod exec;
pub mod mcp;
