use serde::Serialize;

/// Structured trace events emitted across the NEXUS3 crates. Each is
/// logged via `tracing` as a single JSON-valued field so a log pipeline
/// can index on `event` without parsing message text.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    AgentCreated {
        agent_id: String,
        parent_ceiling: String,
    },
    AgentDestroyed {
        agent_id: String,
        reason: String,
    },
    TurnStarted {
        agent_id: String,
        request_id: String,
    },
    TurnCompleted {
        agent_id: String,
        request_id: String,
        iterations: u32,
        outcome: String,
    },
    ToolInvoked {
        agent_id: String,
        tool_name: String,
        call_id: String,
        duration_ms: u64,
        ok: bool,
    },
    PermissionDecision {
        agent_id: String,
        tool_name: String,
        allowed: bool,
        reason: String,
    },
    CompactionRun {
        agent_id: String,
        before_tokens: usize,
        after_tokens: usize,
        fallback_truncation: bool,
    },
    McpHandshake {
        connection_name: String,
        transport: String,
        tool_count: usize,
        ok: bool,
    },
    ProviderRequest {
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    RpcRequest {
        method: String,
        agent_id: Option<String>,
        duration_ms: u64,
        ok: bool,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "nexus3_event");
    }
}
