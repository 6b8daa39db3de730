//! Session turn engine (spec §4.9).
//!
//! Drives one `send` call end to end: stream a completion, execute any
//! requested tool calls (sequential and stop-on-error by default, opt-in
//! parallel via a reserved `_parallel` argument), feed results back, and
//! repeat until the model stops calling tools, the iteration cap is hit,
//! or the caller cancels. Progress is reported to the caller through a
//! droppable event channel — a slow or absent subscriber never blocks
//! the turn itself.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use nexus3_domain::cancel::CancelToken;
use nexus3_domain::capability::ModelRole;
use nexus3_domain::config::ToolPolicy;
use nexus3_domain::error::{Error, Result};
use nexus3_domain::permission::{CallContext, Decision, EffectivePolicy, PermissionPolicy};
use nexus3_domain::stream::StreamEvent;
use nexus3_domain::tool::{Message, PermissionGate, ToolCall, ToolDescriptor, ToolResult};
use nexus3_domain::trace::TraceEvent;
use nexus3_mcp::McpManager;
use nexus3_providers::{ChatRequest, LlmRouter};

use crate::context::ContextManager;
use crate::registry::ToolRegistry;

const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 10;
const CANCEL_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum TurnEvent {
    ToolBatchStarted { count: usize, parallel: bool },
    ToolStarted { call_id: String, name: String },
    ToolCompleted { call_id: String, ok: bool, error: Option<String> },
    ToolBatchHalted { reason: String },
    ToolBatchCompleted,
    IterationCompleted { iteration: u32 },
    Completed { message: Message },
    Cancelled,
    Halted { reason: String },
}

/// Resources a turn needs; bundled so `run_turn` takes one argument
/// instead of growing a parameter per module it touches.
pub struct TurnRunContext {
    pub agent_id: String,
    pub owner_id: String,
    pub router: Arc<LlmRouter>,
    pub context: Arc<ContextManager>,
    pub registry: Arc<ToolRegistry>,
    pub mcp: Arc<McpManager>,
    pub tool_policy: ToolPolicy,
    pub policy: PermissionPolicy,
    pub ceilings: Vec<PermissionPolicy>,
    pub max_iterations: u32,
    pub max_concurrent_tools: usize,
}

impl TurnRunContext {
    fn effective_policy(&self) -> EffectivePolicy<'_> {
        EffectivePolicy {
            own: &self.policy,
            ceilings: self.ceilings.iter().collect(),
        }
    }
}

/// Flush tool calls that were still in flight when a previous turn was
/// cancelled: each becomes a synthetic failed tool-result so the next
/// turn's message list never has a dangling assistant tool call.
pub fn flush_pending_cancelled(context: &ContextManager, pending: Vec<ToolCall>) {
    for call in pending {
        context.append(Message::tool_result(call.id, "cancelled before completion"));
    }
}

pub async fn run_turn(ctx: &TurnRunContext, user_message: String, cancel: CancelToken, events: mpsc::Sender<TurnEvent>) -> Result<Message> {
    ctx.context.append(Message::user(user_message));

    let mut iteration = 0u32;
    let max_iterations = if ctx.max_iterations == 0 { DEFAULT_MAX_ITERATIONS } else { ctx.max_iterations };

    loop {
        if cancel.is_cancelled() {
            let _ = events.try_send(TurnEvent::Cancelled);
            return Err(Error::tool(nexus3_domain::error::ToolErrorKind::Cancelled, "turn cancelled"));
        }

        iteration += 1;
        if iteration > max_iterations {
            let note = format!("stopped after {max_iterations} iterations without a final answer");
            let halt_message = Message::assistant(note.clone(), vec![]);
            ctx.context.append(halt_message.clone());
            let _ = events.try_send(TurnEvent::Halted { reason: note });
            return Ok(halt_message);
        }

        let tool_defs: Vec<ToolDescriptor> = ctx.registry.get_definitions(&ctx.tool_policy, &ctx.agent_id, &ctx.owner_id);
        let tool_def_values: Vec<Value> = tool_defs.iter().map(ToolDescriptor::to_definition).collect();
        let tool_def_tokens = nexus3_domain::tokens::count_tool_definitions(&tool_def_values);

        let mut messages = vec![Message::system(ctx.context.system_prompt())];
        messages.extend(ctx.context.prepare_turn(&ctx.router, tool_def_tokens).await);

        let req = ChatRequest {
            messages,
            tools: tool_defs.clone(),
            temperature: None,
            max_tokens: None,
            model: None,
        };

        let assistant_message = match stream_completion(ctx, req, &cancel, &events).await {
            Ok(m) => m,
            Err(e) => {
                let _ = events.try_send(TurnEvent::Halted { reason: e.to_string() });
                return Err(e);
            }
        };

        ctx.context.append(assistant_message.clone());

        if !assistant_message.has_tool_calls() {
            let _ = events.try_send(TurnEvent::Completed { message: assistant_message.clone() });
            return Ok(assistant_message);
        }

        let halted = run_tool_batch(ctx, &assistant_message.tool_calls, &cancel, &events).await;
        let _ = events.try_send(TurnEvent::IterationCompleted { iteration });
        if halted {
            return Ok(assistant_message);
        }
    }
}

async fn stream_completion(ctx: &TurnRunContext, req: ChatRequest, cancel: &CancelToken, events: &mpsc::Sender<TurnEvent>) -> Result<Message> {
    let mut stream = ctx.router.stream_for_role(ModelRole::Executor, req).await?;
    while let Some(event) = stream.next().await {
        if cancel.is_cancelled() {
            drop(stream);
            let _ = events.try_send(TurnEvent::Cancelled);
            return Err(Error::tool(nexus3_domain::error::ToolErrorKind::Cancelled, "turn cancelled mid-stream"));
        }
        match event? {
            StreamEvent::ContentDelta { .. } | StreamEvent::ReasoningDelta { .. } => {}
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                let _ = events.try_send(TurnEvent::ToolStarted { call_id, name: tool_name });
            }
            StreamEvent::StreamComplete { message, .. } => return Ok(message),
            StreamEvent::Error { message } => return Err(Error::Other(message)),
        }
    }
    Err(Error::Other("provider stream ended without a completion event".to_string()))
}

/// Returns `true` if the batch halted early (a tool failed, or a
/// required argument was missing) and the turn should stop iterating.
async fn run_tool_batch(ctx: &TurnRunContext, calls: &[ToolCall], cancel: &CancelToken, events: &mpsc::Sender<TurnEvent>) -> bool {
    let parallel = calls.iter().any(|c| c.arguments.get("_parallel").and_then(Value::as_bool).unwrap_or(false));
    let _ = events.try_send(TurnEvent::ToolBatchStarted { count: calls.len(), parallel });

    if parallel {
        let limit = if ctx.max_concurrent_tools == 0 { DEFAULT_MAX_CONCURRENT_TOOLS } else { ctx.max_concurrent_tools };
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::new();
        for call in calls {
            let permit = semaphore.clone();
            let call = call.clone();
            let cancel = cancel.clone();
            handles.push(async move {
                let _permit = permit.acquire_owned().await.ok();
                run_single_call(ctx, &call, &cancel).await
            });
        }
        let results = futures_util::future::join_all(handles).await;
        let mut halted = false;
        for (call, result) in calls.iter().zip(results.into_iter()) {
            let ok = !result.is_error();
            let _ = events.try_send(TurnEvent::ToolCompleted {
                call_id: call.id.clone(),
                ok,
                error: if ok { None } else { Some(result.error.clone()) },
            });
            ctx.context.append(Message::tool_result(call.id.clone(), tool_result_text(&result)));
            halted = halted || !ok;
        }
        if halted {
            let _ = events.try_send(TurnEvent::ToolBatchHalted { reason: "one or more parallel tool calls failed".to_string() });
        } else {
            let _ = events.try_send(TurnEvent::ToolBatchCompleted);
        }
        halted
    } else {
        for (i, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                for remaining in &calls[i..] {
                    ctx.context.append(Message::tool_result(remaining.id.clone(), "cancelled before completion"));
                }
                let _ = events.try_send(TurnEvent::Cancelled);
                return true;
            }
            let result = run_single_call(ctx, call, cancel).await;
            let ok = !result.is_error();
            let _ = events.try_send(TurnEvent::ToolCompleted {
                call_id: call.id.clone(),
                ok,
                error: if ok { None } else { Some(result.error.clone()) },
            });
            ctx.context.append(Message::tool_result(call.id.clone(), tool_result_text(&result)));
            if !ok {
                let _ = events.try_send(TurnEvent::ToolBatchHalted { reason: format!("tool '{}' failed: {}", call.name, result.error) });
                return true;
            }
        }
        let _ = events.try_send(TurnEvent::ToolBatchCompleted);
        false
    }
}

fn tool_result_text(result: &ToolResult) -> String {
    if result.is_error() {
        format!("error: {}", result.error)
    } else {
        result.output.clone()
    }
}

async fn run_single_call(ctx: &TurnRunContext, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
    if !ctx.registry.exists(&call.name) {
        return ToolResult::failed(format!("unknown tool '{}'", call.name));
    }

    if let Some(missing) = first_missing_required_field(&ctx.registry.descriptor(&call.name), &call.arguments) {
        return ToolResult::failed(format!("missing required argument '{missing}' for tool '{}'", call.name));
    }

    let descriptor = ctx.registry.descriptor(&call.name);

    let decision = if let Some((server, tool)) = ctx.registry.mcp_target(&call.name) {
        let mut decision = ctx.mcp.check_consent(&ctx.policy, &server, &tool);
        for ceiling in &ctx.ceilings {
            decision = decision.intersect(ctx.mcp.check_consent(ceiling, &server, &tool));
        }
        decision
    } else {
        let gate = descriptor.as_ref().map(|d| d.permission_required_for).unwrap_or(PermissionGate::Always);
        let call_ctx = CallContext {
            gate,
            is_write: is_write_call(&call.name, &call.arguments),
            requests_network: gate == PermissionGate::Network,
            reason_hash: Some(call.name.clone()),
            target_path: extract_path_arg(&call.arguments),
            target_url: extract_url_arg(&call.arguments),
        };
        ctx.effective_policy().decide(&call.name, &call_ctx)
    };
    if !decision.is_allow() {
        return ToolResult::failed(format!("denied: {decision:?}"));
    }

    let timeout_ms = descriptor.as_ref().and_then(|d| d.timeout_ms).unwrap_or(DEFAULT_TOOL_TIMEOUT_MS);
    let mut arguments = call.arguments.clone();
    if let Value::Object(ref mut map) = arguments {
        map.remove("_parallel");
    }

    let started = std::time::Instant::now();
    let result = tokio::select! {
        result = tokio::time::timeout(Duration::from_millis(timeout_ms), ctx.registry.invoke(&call.name, arguments)) => {
            match result {
                Ok(r) => r,
                Err(_) => ToolResult::failed(format!("tool '{}' timed out after {timeout_ms}ms", call.name)),
            }
        }
        _ = wait_for_cancel_with_grace(cancel) => {
            ToolResult::failed("cancelled")
        }
    };

    TraceEvent::ToolInvoked {
        agent_id: ctx.agent_id.clone(),
        tool_name: call.name.clone(),
        call_id: call.id.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        ok: !result.is_error(),
    }
    .emit();

    result
}

async fn wait_for_cancel_with_grace(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(CANCEL_GRACE).await;
}

fn first_missing_required_field(descriptor: &Option<ToolDescriptor>, arguments: &Value) -> Option<String> {
    let descriptor = descriptor.as_ref()?;
    let required = descriptor.parameters.get("required")?.as_array()?;
    for field in required {
        let field = field.as_str()?;
        if arguments.get(field).is_none() {
            return Some(field.to_string());
        }
    }
    None
}

/// Pulls the filesystem path a call actually targets out of its
/// arguments, checking the argument names the built-in tools use for one.
fn extract_path_arg(arguments: &Value) -> Option<String> {
    ["path", "file_path", "workdir"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(Value::as_str).map(str::to_string))
}

/// Pulls the URL a call actually targets out of its arguments.
fn extract_url_arg(arguments: &Value) -> Option<String> {
    ["url", "uri", "endpoint"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(Value::as_str).map(str::to_string))
}

fn is_write_call(tool_name: &str, arguments: &Value) -> bool {
    if tool_name == "exec" {
        return true;
    }
    matches!(
        arguments.get("action").and_then(Value::as_str),
        Some("write") | Some("kill") | Some("remove") | Some("clear")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_is_detected() {
        let descriptor = ToolDescriptor {
            name: "exec".to_string(),
            description: String::new(),
            parameters: json!({"type": "object", "required": ["command"]}),
            enabled: true,
            permission_required_for: PermissionGate::Always,
            timeout_ms: None,
        };
        let missing = first_missing_required_field(&Some(descriptor), &json!({}));
        assert_eq!(missing.as_deref(), Some("command"));
    }

    #[test]
    fn present_required_field_passes() {
        let descriptor = ToolDescriptor {
            name: "exec".to_string(),
            description: String::new(),
            parameters: json!({"type": "object", "required": ["command"]}),
            enabled: true,
            permission_required_for: PermissionGate::Always,
            timeout_ms: None,
        };
        let missing = first_missing_required_field(&Some(descriptor), &json!({"command": "echo hi"}));
        assert!(missing.is_none());
    }

    #[test]
    fn exec_is_always_treated_as_a_write() {
        assert!(is_write_call("exec", &json!({})));
    }

    #[test]
    fn process_write_action_is_a_write() {
        assert!(is_write_call("process", &json!({"action": "write"})));
        assert!(!is_write_call("process", &json!({"action": "list"})));
    }
}
