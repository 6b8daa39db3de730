//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API, including tool use and streaming,
//! with the Anthropic-specific shape where system messages live in a
//! separate top-level `system` field rather than the message list.

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::from_reqwest;
use nexus3_domain::capability::LlmCapabilities;
use nexus3_domain::config::ProviderConfig;
use nexus3_domain::error::{Error, Result};
use nexus3_domain::stream::{BoxStream, StreamEvent, Usage};
use nexus3_domain::tool::{Message, Role, ToolCall, ToolDescriptor};
use serde_json::Value;
use std::collections::BTreeMap;

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    max_retries: u32,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ProviderConfig, max_retries: u32) -> Result<Self> {
        let api_key = crate::util::resolve_api_key(&cfg.auth)?;
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "claude-sonnet-4-20250514".into());

        let capabilities = LlmCapabilities {
            supports_tools: nexus3_domain::capability::ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: false,
            supports_vision: true,
            context_window_tokens: Some(200_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            capabilities,
            client,
            max_retries,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.clone()),
                Role::User => api_messages.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": api_messages,
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body["max_tokens"] = serde_json::json!(req.max_tokens.unwrap_or(4096));
        body
    }

    fn is_retriable_status(status: reqwest::StatusCode) -> bool {
        status.as_u16() == 429 || status.is_server_error()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    let mut content: Vec<Value> = Vec::new();
    if !msg.content.is_empty() {
        content.push(serde_json::json!({"type": "text", "text": msg.content}));
    }
    for tc in &msg.tool_calls {
        content.push(serde_json::json!({
            "type": "tool_use",
            "id": tc.id,
            "name": tc.name,
            "input": tc.arguments,
        }));
    }
    serde_json::json!({
        "role": "assistant",
        "content": content,
    })
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    serde_json::json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": msg.tool_call_id,
            "content": msg.content,
        }],
    })
}

fn tool_to_anthropic(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage { prompt_tokens: input, completion_tokens: output, total_tokens: input + output })
}

fn parse_messages_response(body: &Value) -> Result<Message> {
    let content_arr = body.get("content").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &content_arr {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = block.get("input").cloned().unwrap_or(Value::Object(Default::default()));
                tool_calls.push(ToolCall { id, name, arguments });
            }
            _ => {}
        }
    }

    Ok(Message::assistant(text_parts.join(""), tool_calls))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE: per-block tool-call accumulator (spec §4.8)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    content: String,
    active_tool_calls: BTreeMap<u64, ToolCallAccumulator>,
    finished_tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    malformed_json_count: u32,
}

impl StreamState {
    fn finalize(&mut self) -> StreamEvent {
        if self.malformed_json_count > 0 {
            tracing::warn!(count = self.malformed_json_count, "skipped malformed tool-call argument fragments");
        }
        let message = Message::assistant(std::mem::take(&mut self.content), std::mem::take(&mut self.finished_tool_calls));
        StreamEvent::StreamComplete { message, usage: self.usage.take() }
    }
}

fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_anthropic_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    events.push(Ok(StreamEvent::ToolCallStarted { call_id: id.clone(), tool_name: name.clone() }));
                    state.active_tool_calls.insert(idx, ToolCallAccumulator { id, name, arguments: String::new() });
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                state.content.push_str(text);
                                events.push(Ok(StreamEvent::ContentDelta { text: text.to_string() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::ReasoningDelta { text: text.to_string() }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(acc) = state.active_tool_calls.get_mut(&idx) {
                                acc.arguments.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(acc) = state.active_tool_calls.remove(&idx) {
                let arguments = serde_json::from_str(&acc.arguments).unwrap_or_else(|_| {
                    state.malformed_json_count += 1;
                    Value::Object(Default::default())
                });
                state.finished_tool_calls.push(ToolCall { id: acc.id, name: acc.name, arguments });
            }
        }

        "message_delta" => {
            if let Some(output) = v.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()) {
                if let Some(ref mut u) = state.usage {
                    u.completion_tokens = output as u32;
                    u.total_tokens = u.prompt_tokens + u.completion_tokens;
                }
            }
        }

        "message_stop" => {
            events.push(Ok(state.finalize()));
        }

        "error" => {
            let msg = v.get("error").and_then(|e| e.get("message")).and_then(|v| v.as_str()).unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        }

        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, req: ChatRequest) -> Result<Message> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, false);

        crate::util::retry_with_backoff(
            self.max_retries,
            |e| e.is_retriable(),
            || {
                let url = url.clone();
                let body = body.clone();
                async move {
                    tracing::debug!(provider = %self.id, %url, "anthropic chat request");
                    let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(std::time::Duration::from_secs);
                    let resp_text = resp.text().await.map_err(from_reqwest)?;

                    if !status.is_success() {
                        if let Some(d) = retry_after {
                            tokio::time::sleep(d).await;
                        }
                        return Err(Error::provider(
                            &self.id,
                            format!("HTTP {} - {}", status.as_u16(), resp_text),
                            Self::is_retriable_status(status),
                        ));
                    }
                    let resp_json: Value = serde_json::from_str(&resp_text)?;
                    parse_messages_response(&resp_json)
                }
            },
        )
        .await
    }

    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, %url, "anthropic stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::provider(
                &provider_id,
                format!("HTTP {} - {}", status.as_u16(), err_text),
                Self::is_retriable_status(status),
            ));
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_anthropic_sse(data, &mut state)))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_block_becomes_tool_call_on_stop() {
        let mut state = StreamState::default();
        parse_anthropic_sse(r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"file_read"}}"#, &mut state);
        parse_anthropic_sse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"a.txt\"}"}}"#, &mut state);
        parse_anthropic_sse(r#"{"type":"content_block_stop","index":0}"#, &mut state);
        assert_eq!(state.finished_tool_calls.len(), 1);
        assert_eq!(state.finished_tool_calls[0].arguments["path"], "a.txt");
    }

    #[test]
    fn message_stop_finalizes_stream_complete() {
        let mut state = StreamState::default();
        parse_anthropic_sse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#, &mut state);
        let events = parse_anthropic_sse(r#"{"type":"message_stop"}"#, &mut state);
        match &events[0] {
            Ok(StreamEvent::StreamComplete { message, .. }) => assert_eq!(message.content, "hi"),
            other => panic!("expected StreamComplete, got {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_json_is_skipped_not_fatal() {
        let mut state = StreamState::default();
        parse_anthropic_sse(r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"x"}}"#, &mut state);
        parse_anthropic_sse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{not json"}}"#, &mut state);
        parse_anthropic_sse(r#"{"type":"content_block_stop","index":0}"#, &mut state);
        assert_eq!(state.malformed_json_count, 1);
        assert!(state.finished_tool_calls[0].arguments.is_object());
    }

    #[test]
    fn thinking_delta_maps_to_reasoning_delta() {
        let mut state = StreamState::default();
        let events = parse_anthropic_sse(r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"pondering"}}"#, &mut state);
        assert!(matches!(events[0], Ok(StreamEvent::ReasoningDelta { .. })));
    }
}
