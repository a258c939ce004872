//! Reusable test doubles for the mcpbox crates
//!
//! Everything here stands in for an external system: the container runtime,
//! the sandboxed MCP server itself (over stdio or HTTP), the bootstrap oracle
//! and the README source.

pub mod calculator;
pub mod mcp_http;
pub mod oracle;
pub mod readme;
pub mod runtime;

pub use calculator::*;
pub use mcp_http::*;
pub use oracle::*;
pub use readme::*;
pub use runtime::*;
