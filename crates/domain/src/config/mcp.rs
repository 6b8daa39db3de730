//! MCP (Model Context Protocol) configuration — the `[mcp]` section.
//!
//! These are deserialization targets only; the client logic that dials
//! these servers lives in the `nexus3-mcp` crate (spec §4.6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// Configuration for a single MCP server connection.
///
/// Exactly one of `command` (stdio transport) or `url` (SSE/HTTP
/// transport) must be set; enforced by `Config::validate`, not here,
/// so a malformed entry still deserializes and can be reported with
/// its index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name for this server, used in tool naming: `mcp:{name}:{tool}`.
    pub name: String,

    #[serde(default)]
    pub transport: McpTransportKind,

    /// The command to spawn for stdio transport (e.g. `"npx"`).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,

    /// Server URL for SSE transport.
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variables to set on a spawned stdio process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether this connection's tools are visible only to the agent that
    /// opened it, or to every agent in the run (spec §4.6 visibility
    /// rules). Sharing connectivity never shares consent: each agent
    /// still maintains its own `session_allowances`.
    #[serde(default)]
    pub visibility: McpVisibility,

    /// Pre-seeded consent mode, set by the owning agent (or by this
    /// config) to skip the interactive prompt on connect.
    #[serde(default)]
    pub consent: McpConsentMode,
}

/// Who can see a connection's discovered tools in their registry view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McpVisibility {
    #[default]
    Private,
    Shared,
}

/// The consent mode an agent grants a connection on connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McpConsentMode {
    AllowAll,
    PerTool,
    #[default]
    Deny,
}

/// Transport kind for connecting to an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_server_deserializes() {
        let json = r#"{"name": "fs", "transport": "stdio", "command": "npx", "args": ["-y", "server-fs"]}"#;
        let server: McpServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(server.transport, McpTransportKind::Stdio);
        assert_eq!(server.command.as_deref(), Some("npx"));
    }

    #[test]
    fn sse_server_deserializes() {
        let json = r#"{"name": "remote", "transport": "sse", "url": "https://mcp.example.com/sse"}"#;
        let server: McpServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(server.transport, McpTransportKind::Sse);
        assert_eq!(server.url.as_deref(), Some("https://mcp.example.com/sse"));
    }
}
