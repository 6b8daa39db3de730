//! JSON-RPC transport (spec §4.12).
//!
//! A loopback-only HTTP/1.1 server exposing two routes: `POST /` (and
//! the alias `POST /rpc`) for the global dispatcher's agent-lifecycle
//! methods, and `POST /agent/:id` for a single agent's `send`/`cancel`/
//! `get_tokens`/`get_context`/`shutdown`/`compact`. Every request must
//! carry `Authorization: Bearer <token>`, checked in constant time
//! against a token written to `rpc-<port>.token` (mode 0600) at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use nexus3_domain::config::ServerConfig;
use nexus3_domain::error::Error;
use nexus3_domain::trace::TraceEvent;

use crate::pool::{self, AgentDispatcher, AgentPool, CreateAgentRequest};
use crate::turn::TurnEvent;

const MAX_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TransportState {
    pub pool: Arc<AgentPool>,
    pub auth_token: Arc<str>,
}

pub fn build_router(state: TransportState) -> Router {
    Router::new()
        .route("/", post(handle_global))
        .route("/rpc", post(handle_global))
        .route("/agent/:id", post(handle_agent))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Binds and serves, re-checking loopback-only at the moment of bind
/// even though `Config::validate` already checked it at load time — the
/// config could in principle be mutated between load and here in a
/// future embedding of this crate, and the bind is the point of no
/// return.
pub async fn serve(server: &ServerConfig, router: Router) -> std::io::Result<()> {
    if !server.is_loopback_host() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("refusing to bind to non-loopback host '{}': the RPC transport is local-only", server.host),
        ));
    }
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nexus3 rpc transport listening");
    axum::serve(listener, router).await
}

/// Writes the bearer token to `<dir>/rpc-<port>.token` with mode 0600 so
/// only the local user can read it, and returns the generated token.
pub fn write_token_file(dir: &std::path::Path, port: u16) -> std::io::Result<String> {
    use rand::Rng;
    let token: String = {
        let mut rng = rand::thread_rng();
        (0..32).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect()
    };
    std::fs::create_dir_all(dir)?;
    let path: PathBuf = dir.join(format!("rpc-{port}.token"));
    std::fs::write(&path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(token)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON-RPC 2.0 subset
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn rpc_error(id: Option<Value>, code: i64, message: impl Into<String>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    }))
}

fn rpc_result(id: Option<Value>, result: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn check_auth(state: &TransportState, headers: &HeaderMap) -> bool {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    if presented.len() != state.auth_token.len() {
        return false;
    }
    presented.as_bytes().ct_eq(state.auth_token.as_bytes()).into()
}

/// Pulls `jsonrpc`/`method`/`params`/`id` out of a raw body, enforcing
/// the subset this transport accepts: no batches, `params` must be an
/// object or absent.
struct ParsedRequest {
    id: Option<Value>,
    method: String,
    params: Value,
}

fn parse_request(body: &Value) -> Result<ParsedRequest, (Option<Value>, i64, String)> {
    let obj = body.as_object().ok_or((None, -32600, "Invalid Request: batches are not supported".to_string()))?;
    let id = obj.get("id").cloned();
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or((id.clone(), -32600, "Invalid Request: missing 'method'".to_string()))?
        .to_string();
    let params = match obj.get("params") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(_) => return Err((id, -32602, "Invalid params: must be an object".to_string())),
    };
    Ok(ParsedRequest { id, method, params })
}

async fn handle_global(State(state): State<TransportState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !check_auth(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let started = std::time::Instant::now();
    let parsed = match parse_request(&body) {
        Ok(p) => p,
        Err((id, code, message)) => return rpc_error(id, code, message).into_response(),
    };

    let result = match tokio::time::timeout(REQUEST_TIMEOUT, dispatch_global(&state, &parsed.method, &parsed.params)).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout("global rpc request timed out".to_string())),
    };

    TraceEvent::RpcRequest {
        method: parsed.method.clone(),
        agent_id: None,
        duration_ms: started.elapsed().as_millis() as u64,
        ok: result.is_ok(),
    }
    .emit();

    match result {
        Ok(value) => rpc_result(parsed.id, value).into_response(),
        Err(e) => rpc_error(parsed.id, error_code(&e), e.to_string()).into_response(),
    }
}

async fn handle_agent(State(state): State<TransportState>, Path(agent_id): Path<String>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !check_auth(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response();
    }

    let started = std::time::Instant::now();
    let parsed = match parse_request(&body) {
        Ok(p) => p,
        Err((id, code, message)) => return rpc_error(id, code, message).into_response(),
    };

    let Some(agent) = state.pool.get(&agent_id) else {
        return rpc_error(parsed.id, pool::RPC_CODE_AGENT_NOT_FOUND, format!("agent '{agent_id}' not found")).into_response();
    };

    let dispatcher = AgentDispatcher::new(agent, state.pool.resources());
    let result = match tokio::time::timeout(REQUEST_TIMEOUT, dispatch_agent(&dispatcher, &parsed.method, &parsed.params)).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout("agent rpc request timed out".to_string())),
    };

    TraceEvent::RpcRequest {
        method: parsed.method.clone(),
        agent_id: Some(agent_id),
        duration_ms: started.elapsed().as_millis() as u64,
        ok: result.is_ok(),
    }
    .emit();

    match result {
        Ok(value) => rpc_result(parsed.id, value).into_response(),
        Err(e) => rpc_error(parsed.id, error_code(&e), e.to_string()).into_response(),
    }
}

fn error_code(e: &Error) -> i64 {
    if pool::is_agent_not_found(e) {
        return pool::RPC_CODE_AGENT_NOT_FOUND;
    }
    if pool::is_duplicate_agent_id(e) {
        return pool::RPC_CODE_DUPLICATE_AGENT_ID;
    }
    e.rpc_code()
}

async fn dispatch_global(state: &TransportState, method: &str, params: &Value) -> nexus3_domain::error::Result<Value> {
    match method {
        "create_agent" => {
            let req = CreateAgentRequest {
                id: params.get("id").and_then(Value::as_str).map(str::to_string),
                preset: params.get("preset").and_then(Value::as_str).map(str::to_string),
                system_prompt: params.get("system_prompt").and_then(Value::as_str).map(str::to_string),
                permission_level: None,
                disable_tools: params
                    .get("disable_tools")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
            };
            let summary = state.pool.create_agent(req, None)?;
            Ok(json!({
                "id": summary.id,
                "permission_level": format!("{:?}", summary.permission_level).to_lowercase(),
                "created_at": summary.created_at.to_rfc3339(),
            }))
        }
        "list_agents" => {
            let agents = state.pool.list_agents();
            Ok(json!(agents
                .into_iter()
                .map(|a| json!({
                    "id": a.id,
                    "owner_id": a.owner_id,
                    "depth": a.depth,
                    "permission_level": format!("{:?}", a.permission_level).to_lowercase(),
                    "message_count": a.message_count,
                    "created_at": a.created_at.to_rfc3339(),
                }))
                .collect::<Vec<_>>()))
        }
        "destroy_agent" => {
            let id = params
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("missing 'id'".to_string()))?;
            state.pool.destroy_agent(id)?;
            Ok(json!({"ok": true}))
        }
        "shutdown_server" => {
            state.pool.shutdown_server().await;
            Ok(json!({"ok": true}))
        }
        other => Err(Error::Validation(format!("unknown method '{other}'"))),
    }
}

async fn dispatch_agent(dispatcher: &AgentDispatcher<'_>, method: &str, params: &Value) -> nexus3_domain::error::Result<Value> {
    match method {
        "send" => {
            let content = params
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("missing 'content'".to_string()))?
                .to_string();
            let request_id = uuid::Uuid::new_v4().to_string();
            let (tx, _rx) = mpsc::channel::<TurnEvent>(64);
            match dispatcher.send(content, request_id.clone(), tx).await {
                Ok(response) => Ok(json!({
                    "content": response.content,
                    "request_id": request_id,
                })),
                Err(Error::Tool { kind: nexus3_domain::error::ToolErrorKind::Cancelled, .. }) => {
                    Ok(json!({ "cancelled": true, "request_id": request_id }))
                }
                Err(e) => Err(e),
            }
        }
        "grant_mcp_consent" => {
            let server = params
                .get("server")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("missing 'server'".to_string()))?;
            let tool = params
                .get("tool")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("missing 'tool'".to_string()))?;
            let choice = match params.get("choice").and_then(Value::as_str) {
                Some("once") => nexus3_mcp::ConsentChoice::Once,
                Some("this_tool_always") => nexus3_mcp::ConsentChoice::ThisToolAlways,
                Some("this_server_always") => nexus3_mcp::ConsentChoice::ThisServerAlways,
                Some("deny") => nexus3_mcp::ConsentChoice::Deny,
                _ => return Err(Error::Validation("'choice' must be one of: once, this_tool_always, this_server_always, deny".to_string())),
            };
            dispatcher.grant_mcp_consent(server, tool, choice);
            Ok(json!({"ok": true}))
        }
        "cancel" => {
            let request_id = params
                .get("request_id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("missing 'request_id'".to_string()))?;
            Ok(json!({"cancelled": dispatcher.cancel(request_id)}))
        }
        "get_tokens" => {
            let report = dispatcher.get_tokens();
            Ok(json!({
                "system_prompt": report.system_prompt,
                "tool_definitions": report.tool_definitions,
                "messages": report.messages,
                "available": report.available,
                "total": report.total,
            }))
        }
        "get_context" => {
            let (message_count, has_system_prompt) = dispatcher.get_context();
            Ok(json!({"message_count": message_count, "has_system_prompt": has_system_prompt}))
        }
        "compact" => {
            dispatcher.compact().await?;
            Ok(json!({"ok": true}))
        }
        "shutdown" => {
            dispatcher.shutdown()?;
            Ok(json!({"ok": true}))
        }
        other => Err(Error::Validation(format!("unknown method '{other}'"))),
    }
}
