use serde::{Deserialize, Serialize};

/// A single role in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call emitted by the assistant as part of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A message in the conversation. Flat by design: `tool_calls` is only
/// meaningful on `Role::Assistant` messages, `tool_call_id` only on
/// `Role::Tool` messages. Producers are responsible for only populating
/// the field that matches the role; consumers should not assume the
/// other is absent for any other reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: String::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: String::new(),
        }
    }

    /// An assistant message with text content and zero or more tool calls.
    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: String::new(),
        }
    }

    /// A tool-result message paired with the `ToolCall::id` it answers.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// True for assistant messages that requested at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// The outcome of executing a single tool call. A nonempty `error` means
/// the call failed regardless of whatever is in `output`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// A point at which a tool requires explicit permission before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionGate {
    /// No special gate; subject to the base policy level only.
    None,
    /// Gated whenever the call would touch the filesystem.
    FileAccess,
    /// Gated whenever the call would reach the network.
    Network,
    /// Always gated regardless of policy level (e.g. process execution).
    Always,
}

impl Default for PermissionGate {
    fn default() -> Self {
        PermissionGate::None
    }
}

/// A tool as advertised to the LLM and to the permission engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub permission_required_for: PermissionGate,
    /// Per-call timeout in milliseconds. `None` means the registry/engine
    /// default applies (30_000ms per the session turn engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl ToolDescriptor {
    pub fn to_definition(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_message_without_tool_calls_has_none() {
        let m = Message::assistant("hello", vec![]);
        assert!(!m.has_tool_calls());
    }

    #[test]
    fn assistant_message_with_tool_calls_reports_them() {
        let m = Message::assistant(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "exec".into(),
                arguments: serde_json::json!({}),
            }],
        );
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn tool_result_nonempty_error_is_failure_regardless_of_output() {
        let r = ToolResult {
            output: "partial output".into(),
            error: "boom".into(),
        };
        assert!(r.is_error());
    }

    #[test]
    fn tool_result_ok_has_no_error() {
        let r = ToolResult::ok("done");
        assert!(!r.is_error());
    }

    #[test]
    fn serializes_tool_call_id_only_for_tool_messages() {
        let m = Message::user("hi");
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("tool_call_id").is_none());
        assert!(v.get("tool_calls").is_none());
    }

    #[test]
    fn tool_descriptor_default_enabled_and_ungated() {
        let d = ToolDescriptor {
            name: "echo".into(),
            description: "echoes input".into(),
            parameters: serde_json::json!({"type": "object"}),
            enabled: true,
            permission_required_for: PermissionGate::None,
            timeout_ms: None,
        };
        assert!(d.enabled);
        assert_eq!(d.permission_required_for, PermissionGate::None);
    }
}
