//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract.

use crate::traits::{ChatRequest, LlmProvider};
use crate::util::from_reqwest;
use nexus3_domain::capability::LlmCapabilities;
use nexus3_domain::config::{AuthMode, ProviderConfig};
use nexus3_domain::error::{Error, Result};
use nexus3_domain::stream::{BoxStream, StreamEvent, Usage};
use nexus3_domain::tool::{Message, Role, ToolCall, ToolDescriptor};
use serde_json::Value;
use std::collections::BTreeMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    auth_mode: AuthMode,
    auth_key: Option<String>,
    auth_header: String,
    auth_prefix: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ProviderConfig, max_retries: u32) -> Result<Self> {
        let auth_key = match cfg.auth.mode {
            AuthMode::None => None,
            _ => Some(crate::util::resolve_api_key(&cfg.auth)?),
        };

        let auth_header = cfg.auth.header.clone().unwrap_or_else(|| "Authorization".into());
        let auth_prefix = cfg.auth.prefix.clone().unwrap_or_else(|| "Bearer ".into());
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into());

        let capabilities = LlmCapabilities {
            supports_tools: nexus3_domain::capability::ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: true,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            auth_mode: cfg.auth.mode,
            auth_key,
            auth_header,
            auth_prefix,
            default_model,
            capabilities,
            client,
            max_retries,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        match (self.auth_mode, &self.auth_key) {
            (AuthMode::ApiKey, Some(key)) => {
                let header_value = format!("{}{}", self.auth_prefix, key);
                builder = builder.header(&self.auth_header, header_value);
            }
            (AuthMode::QueryParam, Some(key)) => {
                builder = builder.query(&[("key", key.as_str())]);
            }
            _ => {}
        }
        builder
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }

    fn is_retriable_status(status: reqwest::StatusCode) -> bool {
        status.as_u16() == 429 || status.is_server_error()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        }),
        Role::Assistant => {
            let mut obj = serde_json::json!({
                "role": "assistant",
                "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
            });
            if msg.has_tool_calls() {
                let tool_calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = Value::Array(tool_calls);
            }
            obj
        }
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content,
        }),
    }
}

fn tool_to_openai(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

fn parse_chat_response(body: &Value) -> Result<Message> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::provider("openai_compat", "no choices in response", false))?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::provider("openai_compat", "no message in choice", false))?;

    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Message::assistant(content, tool_calls))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming: tool-call accumulator keyed by index (spec §4.8)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    content: String,
    tool_calls: BTreeMap<u64, ToolCallAccumulator>,
    started: std::collections::HashSet<u64>,
    usage: Option<Usage>,
    malformed_json_count: u32,
}

impl StreamState {
    fn finalize(&mut self) -> StreamEvent {
        let mut tool_calls = Vec::new();
        for (_, acc) in std::mem::take(&mut self.tool_calls) {
            let id = acc.id.unwrap_or_default();
            let name = acc.name.unwrap_or_default();
            let arguments = serde_json::from_str(&acc.arguments).unwrap_or_else(|_| {
                self.malformed_json_count += 1;
                Value::Object(Default::default())
            });
            tool_calls.push(ToolCall { id, name, arguments });
        }
        if self.malformed_json_count > 0 {
            tracing::warn!(
                count = self.malformed_json_count,
                "skipped malformed tool-call argument fragments"
            );
        }
        let message = Message::assistant(std::mem::take(&mut self.content), tool_calls);
        StreamEvent::StreamComplete { message, usage: self.usage.take() }
    }

    fn parse(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        if data.trim() == "[DONE]" {
            return vec![Ok(self.finalize())];
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

        let choice = match choice {
            Some(c) => c,
            None => {
                if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
                    self.usage = Some(usage);
                }
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let delta = choice.get("delta").unwrap_or(&Value::Null);

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                self.content.push_str(text);
                events.push(Ok(StreamEvent::ContentDelta { text: text.to_string() }));
            }
        }
        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::ReasoningDelta { text: text.to_string() }));
            }
        }
        if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tc_arr {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    if entry.id.is_none() {
                        entry.id = Some(id.to_string());
                    }
                }
                if let Some(name) = tc.get("function").and_then(|f| f.get("name")).and_then(|v| v.as_str()) {
                    if entry.name.is_none() {
                        entry.name = Some(name.to_string());
                    }
                }
                if !self.started.contains(&index) {
                    if let (Some(id), Some(name)) = (&entry.id, &entry.name) {
                        self.started.insert(index);
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: id.clone(),
                            tool_name: name.clone(),
                        }));
                    }
                }
                if let Some(args) = tc.get("function").and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
                    entry.arguments.push_str(args);
                }
            }
        }

        if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
            self.usage = Some(usage);
        }
        if choice.get("finish_reason").and_then(|f| f.as_str()).is_some() {
            events.push(Ok(self.finalize()));
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, req: ChatRequest) -> Result<Message> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, false);

        crate::util::retry_with_backoff(
            self.max_retries,
            |e| e.is_retriable(),
            || {
                let url = url.clone();
                let body = body.clone();
                async move {
                    tracing::debug!(provider = %self.id, %url, "openai_compat chat request");
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
                    parse_chat_response(&resp_json)
                }
            },
        )
        .await
    }

    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, %url, "openai_compat stream request");

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
        Ok(crate::sse::sse_response_stream(resp, move |data| state.parse(data)))
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
    fn tool_call_accumulator_assembles_fragmented_arguments() {
        let mut state = StreamState::default();
        state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"file_read"}}]}}]}"#);
        state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\""}}]}}]}"#);
        state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"a.txt\"}"}}]}}]}"#);
        let events = state.parse("[DONE]");
        match &events[0] {
            Ok(StreamEvent::StreamComplete { message, .. }) => {
                assert_eq!(message.tool_calls.len(), 1);
                assert_eq!(message.tool_calls[0].name, "file_read");
                assert_eq!(message.tool_calls[0].arguments["path"], "a.txt");
            }
            other => panic!("expected StreamComplete, got {other:?}"),
        }
    }

    #[test]
    fn malformed_argument_json_is_skipped_not_fatal() {
        let mut state = StreamState::default();
        state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"x","arguments":"{not json"}}]}}]}"#);
        let events = state.parse("[DONE]");
        match &events[0] {
            Ok(StreamEvent::StreamComplete { message, .. }) => {
                assert_eq!(message.tool_calls.len(), 1);
                assert!(message.tool_calls[0].arguments.is_object());
            }
            other => panic!("expected StreamComplete, got {other:?}"),
        }
        assert_eq!(state.malformed_json_count, 1);
    }

    #[test]
    fn content_deltas_accumulate_into_final_message() {
        let mut state = StreamState::default();
        state.parse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        state.parse(r#"{"choices":[{"delta":{"content":"lo"}}]}"#);
        let events = state.parse(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        match &events[0] {
            Ok(StreamEvent::StreamComplete { message, .. }) => assert_eq!(message.content, "Hello"),
            other => panic!("expected StreamComplete, got {other:?}"),
        }
    }

    #[test]
    fn usage_only_chunk_produces_no_events_but_is_retained() {
        let mut state = StreamState::default();
        let events = state.parse(r#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#);
        assert!(events.is_empty());
        assert_eq!(state.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[test]
    fn tool_call_started_emitted_once_per_call() {
        let mut state = StreamState::default();
        let events = state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"exec"}}]}}]}"#);
        assert!(matches!(events[0], Ok(StreamEvent::ToolCallStarted { .. })));
        let events2 = state.parse(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#);
        assert!(events2.is_empty());
    }
}
