//! `nexus3-mcp` — MCP (Model Context Protocol) client.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for communicating with MCP servers,
//!   including cursor-based pagination for `tools/list`.
//! - A stdio transport that spawns child processes and communicates over
//!   stdin/stdout, and an HTTP transport that POSTs requests and reads
//!   back a plain JSON response or an SSE event stream.
//! - An `McpManager` that manages connections to multiple MCP servers,
//!   orchestrates tool discovery and dispatch, and enforces the
//!   consent/visibility model and sandboxed-agent deny-all rule.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nexus3_mcp::{McpConfig, McpManager};
//!
//! let config: McpConfig = /* from TOML */;
//! let manager = McpManager::from_config(&config).await;
//!
//! // List all discovered tools.
//! for (server_name, tool) in manager.list_tools() {
//!     println!("mcp:{server_name}:{}", tool.name);
//! }
//!
//! // Call a tool.
//! let result = manager.call_tool("filesystem", "read_file", json!({"path": "/tmp/test.txt"})).await?;
//! ```

pub mod config;
pub mod manager;
pub mod protocol;
pub mod transport;

// Re-exports for convenience.
pub use config::{McpConfig, McpServerConfig, McpTransportKind};
pub use manager::{record_consent, ConsentChoice, McpError, McpManager};
pub use protocol::McpToolDef;
