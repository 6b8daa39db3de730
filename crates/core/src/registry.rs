//! Tool registry (spec §4.5).
//!
//! Bridges the built-in `exec`/`process` tools (`nexus3-tools`) and
//! whatever MCP servers are connected (`nexus3-mcp`) into one
//! `name -> descriptor` namespace the turn engine advertises to the
//! model and dispatches calls through. MCP tools are namespaced
//! `mcp_<server>_<tool>` so a collision between a local tool and an MCP
//! tool of the same bare name can never happen.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};

use nexus3_domain::config::ToolPolicy;
use nexus3_domain::error::{Error, Result, ToolErrorKind};
use nexus3_domain::tool::{PermissionGate, ToolDescriptor, ToolResult};
use nexus3_mcp::McpManager;
use nexus3_tools::exec::{self, ExecRequest};
use nexus3_tools::manager::ProcessManager;
use nexus3_tools::process::{self, ProcessRequest};

/// Where a registered name resolves to.
#[derive(Debug, Clone)]
enum Target {
    Exec,
    Process,
    Mcp { server: String, tool: String },
}

struct Entry {
    descriptor: ToolDescriptor,
    target: Target,
}

/// `(name -> descriptor, factory)` map plus the per-agent enable/disable
/// view over it. Local entries are fixed at construction; MCP entries
/// are refreshed from the live `McpManager` state on every lookup, since
/// connections can come and go while the registry itself is shared and
/// long-lived.
pub struct ToolRegistry {
    local: HashMap<String, Entry>,
    mcp: Arc<McpManager>,
    processes: Arc<ProcessManager>,
    /// Resolved `(name -> Target)` cache for MCP names, populated lazily
    /// on first lookup and invalidated whenever the MCP tool set changes
    /// shape (tracked by `mcp.tool_count()` as a cheap generation proxy).
    mcp_cache: RwLock<(usize, HashMap<String, Target>)>,
}

impl ToolRegistry {
    pub fn new(mcp: Arc<McpManager>, processes: Arc<ProcessManager>) -> Self {
        let mut local = HashMap::new();
        local.insert(
            "exec".to_string(),
            Entry {
                descriptor: exec_descriptor(),
                target: Target::Exec,
            },
        );
        local.insert(
            "process".to_string(),
            Entry {
                descriptor: process_descriptor(),
                target: Target::Process,
            },
        );
        Self {
            local,
            mcp,
            processes,
            mcp_cache: RwLock::new((usize::MAX, HashMap::new())),
        }
    }

    /// Tool definitions visible to a given agent, after applying its
    /// `ToolPolicy` allow/deny prefixes. MCP tools are additionally
    /// gated by `tools_visible_to` (connection visibility + ownership).
    pub fn get_definitions(&self, policy: &ToolPolicy, agent_id: &str, owner_id: &str) -> Vec<ToolDescriptor> {
        let mut defs: Vec<ToolDescriptor> = self
            .local
            .values()
            .map(|e| e.descriptor.clone())
            .filter(|d| d.enabled && policy.allows(&d.name))
            .collect();

        for (server, tool) in self.mcp.tools_visible_to(agent_id, owner_id) {
            let name = mcp_tool_name(server, &tool.name);
            if !policy.allows(&name) {
                continue;
            }
            defs.push(ToolDescriptor {
                name,
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
                enabled: true,
                permission_required_for: PermissionGate::Always,
                timeout_ms: None,
            });
        }

        defs
    }

    /// Resolve a registered name to its invocation target, refreshing the
    /// MCP half of the cache if the live tool count has moved since the
    /// last lookup.
    fn resolve(&self, name: &str) -> Option<Target> {
        if let Some(entry) = self.local.get(name) {
            return Some(entry.target.clone());
        }

        let live_count = self.mcp.tool_count();
        {
            let cache = self.mcp_cache.read();
            if cache.0 == live_count {
                if let Some(t) = cache.1.get(name) {
                    return Some(t.clone());
                }
                if cache.1.contains_key(name) || live_count == cache.0 {
                    // Cache is current but doesn't know this name; only
                    // bail out early when we've already rebuilt for this
                    // generation and still found nothing.
                }
            }
        }

        let mut cache = self.mcp_cache.write();
        if cache.0 != live_count {
            let mut rebuilt = HashMap::new();
            for (server, tool) in self.mcp.list_tools() {
                rebuilt.insert(
                    mcp_tool_name(server, &tool.name),
                    Target::Mcp {
                        server: server.to_string(),
                        tool: tool.name.clone(),
                    },
                );
            }
            *cache = (live_count, rebuilt);
        }
        cache.1.get(name).cloned()
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.local.get(name).map(|e| e.descriptor.clone())
    }

    /// `(server, tool)` this registry name resolves to, if it's an MCP
    /// tool — lets callers route MCP calls through the MCP consent engine
    /// instead of the generic permission gate.
    pub fn mcp_target(&self, name: &str) -> Option<(String, String)> {
        match self.resolve(name) {
            Some(Target::Mcp { server, tool }) => Some((server, tool)),
            _ => None,
        }
    }

    /// Invoke a tool by its registry name. Never panics on a malformed
    /// argument payload — deserialize failures become a `ToolResult`
    /// error, matching the turn engine's "engine wraps every invocation"
    /// contract (spec §9). A panic inside the tool implementation itself
    /// is also caught, per §10.2's "caught panic during tool execution
    /// becomes `ToolResult{error: ...}`" — the calling turn never unwinds.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolResult {
        match self.resolve(name) {
            Some(Target::Exec) => match serde_json::from_value::<ExecRequest>(arguments) {
                Ok(req) => {
                    match AssertUnwindSafe(exec::exec(&self.processes, req)).catch_unwind().await {
                        Ok(resp) => match serde_json::to_string_pretty(&resp) {
                            Ok(s) => ToolResult::ok(s),
                            Err(e) => ToolResult::failed(format!("failed to serialize exec response: {e}")),
                        },
                        Err(_) => ToolResult::failed("tool panicked: exec"),
                    }
                }
                Err(e) => ToolResult::failed(format!("invalid exec arguments: {e}")),
            },
            Some(Target::Process) => match serde_json::from_value::<ProcessRequest>(arguments) {
                Ok(req) => {
                    match AssertUnwindSafe(process::handle_process(&self.processes, req)).catch_unwind().await {
                        Ok(resp) => match serde_json::to_string_pretty(&resp) {
                            Ok(s) => ToolResult::ok(s),
                            Err(e) => ToolResult::failed(format!("failed to serialize process response: {e}")),
                        },
                        Err(_) => ToolResult::failed("tool panicked: process"),
                    }
                }
                Err(e) => ToolResult::failed(format!("invalid process arguments: {e}")),
            },
            Some(Target::Mcp { server, tool }) => {
                match AssertUnwindSafe(self.mcp.call_tool(&server, &tool, arguments)).catch_unwind().await {
                    Ok(Ok(result)) => {
                        let text = result
                            .content
                            .iter()
                            .map(|c| c.text.as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        if result.is_error {
                            ToolResult::failed(text)
                        } else {
                            ToolResult::ok(text)
                        }
                    }
                    Ok(Err(e)) => ToolResult::failed(e.to_string()),
                    Err(_) => ToolResult::failed(format!("tool panicked: mcp_{server}_{tool}")),
                }
            }
            None => ToolResult::failed(format!("unknown tool '{name}'")),
        }
    }

    /// Whether `name` resolves to anything at all, independent of policy
    /// — used to distinguish "unknown tool" from "denied tool" when
    /// classifying a turn-halting error.
    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn error_for_unknown(name: &str) -> Error {
        Error::tool(ToolErrorKind::UnknownTool, format!("unknown tool '{name}'"))
    }
}

/// `mcp_<server>_<tool>` — underscore-separated so it survives being
/// sent to providers that restrict function names to `[A-Za-z0-9_-]`.
/// Distinct from the `mcp:{server}:{tool}` convention the mcp-client
/// crate uses internally for consent/reason-hash bookkeeping.
pub fn mcp_tool_name(server: &str, tool: &str) -> String {
    format!("mcp_{}_{}", sanitize(server), sanitize(tool))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn exec_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "exec".to_string(),
        description: "Run a shell command in the foreground or background.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run."},
                "background": {"type": "boolean", "description": "Run in the background and return immediately."},
                "yield_ms": {"type": "integer", "description": "How long to wait before auto-backgrounding (0 = wait forever)."},
                "timeout_sec": {"type": "integer", "description": "Hard kill timeout in seconds."},
                "workdir": {"type": "string"},
                "env": {"type": "object", "additionalProperties": {"type": "string"}}
            },
            "required": ["command"]
        }),
        enabled: true,
        permission_required_for: PermissionGate::Always,
        timeout_ms: None,
    }
}

fn process_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "process".to_string(),
        description: "Manage background process sessions started by exec (list, poll, log, write, kill, clear, remove).".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"]},
                "session_id": {"type": "string"},
                "offset": {"type": "integer"},
                "limit": {"type": "integer"},
                "tail_lines": {"type": "integer"},
                "data": {"type": "string"},
                "eof": {"type": "boolean"}
            },
            "required": ["action"]
        }),
        enabled: true,
        permission_required_for: PermissionGate::FileAccess,
        timeout_ms: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_tool_name_is_underscore_separated() {
        assert_eq!(mcp_tool_name("filesystem", "read_file"), "mcp_filesystem_read_file");
    }

    #[test]
    fn mcp_tool_name_sanitizes_delimiters() {
        assert_eq!(mcp_tool_name("my:server", "do.thing"), "mcp_my_server_do_thing");
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_a_failed_result_not_a_panic() {
        let registry = ToolRegistry::new(
            Arc::new(McpManager::empty()),
            Arc::new(ProcessManager::new(Default::default())),
        );
        let result = registry.invoke("does_not_exist", json!({})).await;
        assert!(result.is_error());
    }

    #[test]
    fn get_definitions_excludes_disabled_descriptors() {
        let mut registry = ToolRegistry::new(
            Arc::new(McpManager::empty()),
            Arc::new(ProcessManager::new(Default::default())),
        );
        registry.local.get_mut("exec").unwrap().descriptor.enabled = false;
        let policy = ToolPolicy { allow: vec![], deny: vec![] };
        let defs = registry.get_definitions(&policy, "agent-1", "agent-1");
        assert!(defs.iter().all(|d| d.name != "exec"));
        assert!(defs.iter().any(|d| d.name == "process"));
    }

    #[test]
    fn get_definitions_respects_deny_policy() {
        let registry = ToolRegistry::new(
            Arc::new(McpManager::empty()),
            Arc::new(ProcessManager::new(Default::default())),
        );
        let policy = ToolPolicy {
            allow: vec![],
            deny: vec!["exec".to_string()],
        };
        let defs = registry.get_definitions(&policy, "agent-1", "agent-1");
        assert!(defs.iter().all(|d| d.name != "exec"));
        assert!(defs.iter().any(|d| d.name == "process"));
    }
}
