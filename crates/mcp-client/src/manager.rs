//! MCP manager — holds all MCP server connections and orchestrates tool
//! discovery, consent, visibility, and dispatch.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{self, tools_list_params, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
use nexus3_domain::config::{McpConfig, McpConsentMode, McpServerConfig, McpTransportKind, McpVisibility};
use nexus3_domain::permission::{CallContext, Decision, PermissionLevel, PermissionPolicy};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An MCP server connection (one per configured server).
pub struct McpServer {
    /// Server name from config, used as the registry key and in tool
    /// naming (`mcp:{name}:{tool}`).
    pub name: String,
    /// Tools discovered via `tools/list`, accumulated across pages.
    pub tools: Vec<McpToolDef>,
    /// Whether this connection's tools are visible to every agent or
    /// only to the agent that opened it.
    pub visibility: McpVisibility,
    /// Consent mode the owning agent granted this connection.
    pub consent: McpConsentMode,
    /// Handle to the running process or HTTP connection.
    transport: Box<dyn McpTransport>,
}

impl McpServer {
    /// Initialize a server: spawn the process (or dial HTTP),
    /// perform the MCP handshake, and discover tools (following
    /// pagination cursors until exhausted).
    async fn initialize(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => {
                let t = StdioTransport::spawn(config).map_err(McpError::Transport)?;
                Box::new(t)
            }
            McpTransportKind::Sse => {
                let url = config.url.as_deref().ok_or_else(|| {
                    McpError::Protocol(format!("server '{}' has no url configured", config.name))
                })?;
                Box::new(HttpTransport::new(url))
            }
        };

        // Step 1: Send `initialize` request.
        let init_params = protocol::initialize_params();
        let params_value = serde_json::to_value(&init_params)
            .map_err(|e| McpError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = transport
            .send_request("initialize", Some(params_value))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!("initialize failed: {err}")));
        }

        tracing::debug!(server_name = %config.name, "MCP initialize response received");

        // Step 2: Send `notifications/initialized` notification.
        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(McpError::Transport)?;

        tracing::debug!(server_name = %config.name, "sent notifications/initialized");

        // Step 3: Discover tools via `tools/list`, following `nextCursor`
        // until the server stops returning one.
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = tools_list_params(cursor.as_deref());
            let tools_resp = transport
                .send_request("tools/list", params)
                .await
                .map_err(McpError::Transport)?;

            if tools_resp.is_error() {
                tracing::warn!(
                    server_name = %config.name,
                    "tools/list returned error, stopping discovery with tools gathered so far"
                );
                break;
            }

            let result_value = tools_resp.result.unwrap_or(Value::Null);
            match serde_json::from_value::<ToolsListResult>(result_value) {
                Ok(mut page) => {
                    tools.append(&mut page.tools);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        server_name = %config.name,
                        error = %e,
                        "failed to parse tools/list result, stopping discovery"
                    );
                    break;
                }
            }
        }

        tracing::info!(
            server_name = %config.name,
            tool_count = tools.len(),
            "MCP server initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            tools,
            visibility: config.visibility,
            consent: config.consent,
            transport,
        })
    }

    /// Check if the server's transport is still alive.
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Call a tool on this server.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.name.clone()));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments
        });

        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            let err = resp.error.unwrap();
            return Err(McpError::Protocol(format!("tools/call failed: {err}")));
        }

        let result_value = resp.result.unwrap_or(Value::Null);
        serde_json::from_value::<ToolCallResult>(result_value)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    /// Gracefully shut down the server.
    async fn shutdown(&self) {
        tracing::info!(server_name = %self.name, "shutting down MCP server");
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Consent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A choice made when prompted for per-tool consent (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentChoice {
    Once,
    ThisToolAlways,
    ThisServerAlways,
    Deny,
}

/// Reason-hash key for a tool-scoped session allowance.
fn tool_reason_hash(server_name: &str, tool_name: &str) -> String {
    format!("mcp:{server_name}:{tool_name}")
}

/// Reason-hash key for a server-scoped session allowance.
fn server_reason_hash(server_name: &str) -> String {
    format!("mcp:{server_name}:*")
}

/// Apply a consent choice to the owner's policy, recording it as a
/// session allowance where the choice says "always".
pub fn record_consent(
    policy: &mut PermissionPolicy,
    server_name: &str,
    tool_name: &str,
    choice: ConsentChoice,
) {
    match choice {
        ConsentChoice::Once | ConsentChoice::Deny => {}
        ConsentChoice::ThisToolAlways => policy.allow_for_session(tool_reason_hash(server_name, tool_name)),
        ConsentChoice::ThisServerAlways => policy.allow_for_session(server_reason_hash(server_name)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager that holds all MCP server connections.
pub struct McpManager {
    servers: HashMap<String, McpServer>,
}

impl McpManager {
    /// Create an empty manager (no MCP servers configured).
    pub fn empty() -> Self {
        Self { servers: HashMap::new() }
    }

    /// Initialize from config: spawn processes, send initialize, discover
    /// tools. Servers that fail to initialize are logged and skipped.
    pub async fn from_config(config: &McpConfig) -> Self {
        let mut servers = HashMap::new();

        for server_config in &config.servers {
            tracing::info!(
                server_name = %server_config.name,
                transport = ?server_config.transport,
                "initializing MCP server"
            );

            match McpServer::initialize(server_config).await {
                Ok(server) => {
                    servers.insert(server_config.name.clone(), server);
                }
                Err(e) => {
                    tracing::warn!(
                        server_name = %server_config.name,
                        error = %e,
                        "failed to initialize MCP server, skipping"
                    );
                }
            }
        }

        if !servers.is_empty() {
            tracing::info!(count = servers.len(), "MCP manager ready");
        }

        Self { servers }
    }

    /// Drop connections whose transport has died. Spec §4.6: a dead
    /// connection is "silently dropped from all agent views at the next
    /// registry refresh" — call this wherever that refresh happens.
    pub fn prune_dead(&mut self) {
        let dead: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, s)| !s.is_alive())
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            tracing::warn!(server_name = %name, "dropping dead MCP connection from registry");
            self.servers.remove(&name);
        }
    }

    /// Tools visible to a given agent: all `shared` connections' tools,
    /// plus `private` connections' tools if `agent_id` is the owner.
    ///
    /// `owner_id` identifies the agent that opened each private
    /// connection; callers that don't track per-connection ownership can
    /// pass the same id used to open every connection.
    pub fn tools_visible_to<'a>(&'a self, agent_id: &str, owner_id: &str) -> Vec<(&'a str, &'a McpToolDef)> {
        self.servers
            .values()
            .filter(|s| s.is_alive())
            .filter(|s| s.visibility == McpVisibility::Shared || agent_id == owner_id)
            .flat_map(|server| server.tools.iter().map(move |tool| (server.name.as_str(), tool)))
            .collect()
    }

    /// Get all discovered tools across all alive servers, ignoring
    /// visibility. Used by callers that don't model per-agent views.
    pub fn list_tools(&self) -> Vec<(&str, &McpToolDef)> {
        self.servers
            .values()
            .filter(|s| s.is_alive())
            .flat_map(|server| server.tools.iter().map(move |tool| (server.name.as_str(), tool)))
            .collect()
    }

    /// Decide whether `agent_policy` may call `tool_name` on `server_name`
    /// right now, applying spec §4.6's consent and sandbox rules:
    /// - Sandboxed agents are always denied.
    /// - `deny` connections are always denied.
    /// - `allow_all` connections are always allowed.
    /// - `per_tool` connections require a standing session allowance
    ///   (from a prior "always" consent choice), otherwise confirmation
    ///   is required before the call can proceed.
    pub fn check_consent(&self, agent_policy: &PermissionPolicy, server_name: &str, tool_name: &str) -> Decision {
        if agent_policy.level() == PermissionLevel::Sandboxed {
            return Decision::Deny("sandboxed agents cannot use MCP tools".to_string());
        }

        let Some(server) = self.servers.get(server_name) else {
            return Decision::Deny(format!("MCP server '{server_name}' is not connected"));
        };

        match server.consent {
            McpConsentMode::Deny => Decision::Deny(format!("connection '{server_name}' denies all tool calls")),
            McpConsentMode::AllowAll => Decision::Allow,
            McpConsentMode::PerTool => {
                let ctx = CallContext {
                    reason_hash: Some(tool_reason_hash(server_name, tool_name)),
                    ..Default::default()
                };
                if agent_policy.session_allowances.contains(&tool_reason_hash(server_name, tool_name))
                    || agent_policy.session_allowances.contains(&server_reason_hash(server_name))
                {
                    Decision::Allow
                } else {
                    let _ = ctx; // reason_hash carried for future session-allowance lookups
                    Decision::RequireConfirmation(format!(
                        "tool '{tool_name}' on '{server_name}' requires per-call consent"
                    ))
                }
            }
        }
    }

    /// Call a tool on a specific server.
    pub async fn call_tool(&self, server_name: &str, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| McpError::ServerNotFound(server_name.to_string()))?;

        server.call_tool(tool_name, arguments).await
    }

    /// Return the number of connected servers.
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Return the total number of discovered tools across all alive servers.
    pub fn tool_count(&self) -> usize {
        self.servers.values().filter(|s| s.is_alive()).map(|s| s.tools.len()).sum()
    }

    /// Check if there are any configured servers.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Gracefully shut down all servers concurrently.
    pub async fn shutdown(&self) {
        let futs: Vec<_> = self.servers.values().map(|s| s.shutdown()).collect();
        futures_util::future::join_all(futs).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors specific to MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),
}

impl From<McpError> for nexus3_domain::error::Error {
    fn from(e: McpError) -> Self {
        nexus3_domain::error::Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(level: PermissionLevel) -> PermissionPolicy {
        PermissionPolicy::new(level)
    }

    #[test]
    fn sandboxed_agents_are_always_denied() {
        let manager = McpManager::empty();
        let p = policy(PermissionLevel::Sandboxed);
        assert!(matches!(
            manager.check_consent(&p, "fs", "read_file"),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn unconnected_server_is_denied() {
        let manager = McpManager::empty();
        let p = policy(PermissionLevel::Trusted);
        assert!(matches!(
            manager.check_consent(&p, "fs", "read_file"),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn record_consent_this_tool_always_seeds_session_allowance() {
        let mut p = policy(PermissionLevel::Trusted);
        record_consent(&mut p, "fs", "read_file", ConsentChoice::ThisToolAlways);
        assert!(p.session_allowances.contains(&tool_reason_hash("fs", "read_file")));
    }

    #[test]
    fn record_consent_once_does_not_persist() {
        let mut p = policy(PermissionLevel::Trusted);
        record_consent(&mut p, "fs", "read_file", ConsentChoice::Once);
        assert!(p.session_allowances.is_empty());
    }

    #[test]
    fn record_consent_server_always_covers_any_tool() {
        let mut p = policy(PermissionLevel::Trusted);
        record_consent(&mut p, "fs", "read_file", ConsentChoice::ThisServerAlways);
        assert!(p.session_allowances.contains(&server_reason_hash("fs")));
    }
}
