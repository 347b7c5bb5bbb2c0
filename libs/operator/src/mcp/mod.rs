//! Shared HTTP/JSON transport for the MCP service.
//!
//! All engines talk to MCP through [`client::McpClient`]: bearer auth
//! resolved from secrets, exponential backoff with jitter, and the uniform
//! `{success, data?, error?, meta?}` envelope. The typed wrappers in the
//! sibling modules own the per-operation request/response shapes.

pub mod auth;
pub mod client;
pub mod knowledge;
pub mod org_data;
pub mod remediate;
pub mod sync;
pub mod types;
