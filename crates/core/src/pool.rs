//! Agent pool & global dispatcher (spec §4.11), per-agent dispatcher
//! (spec §4.10).
//!
//! `AgentPool` holds the resources every agent shares (provider router,
//! tool registry, process manager) plus the live `Agent` map. Per-agent
//! operations — `send`, `cancel`, `get_tokens`, `get_context`,
//! `shutdown`, `compact` — are exposed as methods on `AgentDispatcher`,
//! a thin handle bound to one `Arc<Agent>`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;

use nexus3_domain::config::{AgentsConfig, Config};
use nexus3_domain::error::{Error, Result};
use nexus3_domain::permission::{PermissionLevel, PermissionPolicy};
use nexus3_domain::tool::Message;
use nexus3_domain::trace::TraceEvent;
use nexus3_mcp::McpManager;
use nexus3_providers::LlmRouter;
use nexus3_tools::manager::ProcessManager;

use crate::agent::Agent;
use crate::context::{ContextManager, TokenReport};
use crate::registry::ToolRegistry;
use crate::turn::{self, TurnEvent, TurnRunContext};

/// Core-local JSON-RPC error codes that `domain::error::Error::rpc_code`
/// doesn't cover, since agent lifecycle is a core-crate concept the
/// domain crate has no notion of.
pub const RPC_CODE_AGENT_NOT_FOUND: i64 = -32002;
pub const RPC_CODE_DUPLICATE_AGENT_ID: i64 = -32003;

pub struct PoolResources {
    pub config: Arc<Config>,
    pub router: Arc<LlmRouter>,
    pub mcp: Arc<McpManager>,
    pub registry: Arc<ToolRegistry>,
    pub processes: Arc<ProcessManager>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateAgentRequest {
    pub id: Option<String>,
    pub preset: Option<String>,
    pub system_prompt: Option<String>,
    pub permission_level: Option<PermissionLevel>,
    pub disable_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub id: String,
    pub owner_id: String,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub permission_level: PermissionLevel,
    pub message_count: usize,
}

pub struct AgentPool {
    resources: PoolResources,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentPool {
    pub fn new(resources: PoolResources) -> Self {
        Self {
            resources,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn resources(&self) -> &PoolResources {
        &self.resources
    }

    /// `requester` is the effective policy of whatever is asking for
    /// this agent to be created: `None` for a top-level call arriving
    /// over the RPC transport (always treated as non-interactive and
    /// therefore capped at SANDBOXED), `Some` when an existing agent is
    /// spawning a child.
    pub fn create_agent(&self, req: CreateAgentRequest, requester: Option<&Agent>) -> Result<AgentSummary> {
        let agents_config = &self.resources.config.agents;

        let id = match req.id {
            Some(id) => {
                validate_agent_id(&id)?;
                if self.agents.read().contains_key(&id) {
                    return Err(Error::Validation(format!("duplicate agent id '{id}'")));
                }
                id
            }
            None => self.generate_id(),
        };

        let preset = req
            .preset
            .as_deref()
            .and_then(|name| agents_config.presets.get(name))
            .cloned()
            .unwrap_or_default();

        let requested_level = req.permission_level.unwrap_or(preset.permission_level);

        let (owner_id, depth, ceilings) = match requester {
            Some(parent) => {
                if depth_exceeds_limit(parent.depth, agents_config) {
                    return Err(Error::Validation(format!(
                        "max agent nesting depth ({}) exceeded",
                        agents_config.limits.max_depth
                    )));
                }
                let mut ceilings = parent.ceilings.clone();
                ceilings.push(parent.policy_snapshot());
                (parent.owner_id.clone(), parent.depth + 1, ceilings)
            }
            None => {
                if requested_level > PermissionLevel::Sandboxed {
                    return Err(Error::Validation(
                        "agents created over RPC may not escalate above sandboxed".to_string(),
                    ));
                }
                (id.clone(), 1, Vec::new())
            }
        };

        let capped_level = match requester {
            Some(parent) => match parent.max_spawnable_level() {
                Some(ceiling) => requested_level.min(ceiling),
                None => {
                    return Err(Error::Validation("this agent's permission level may not spawn children".to_string()));
                }
            },
            None => requested_level.min(PermissionLevel::Sandboxed),
        };

        let mut policy = PermissionPolicy::new(capped_level);
        policy.disabled_tools.extend(req.disable_tools);

        let tool_policy = preset.tool_policy.clone();
        let context = Arc::new(ContextManager::new(
            self.resources.config.context.clone(),
            req.system_prompt.unwrap_or_default(),
        ));

        let agent = Arc::new(Agent::new(id.clone(), owner_id.clone(), depth, tool_policy, policy, ceilings, context));

        {
            let mut agents = self.agents.write();
            if agents.contains_key(&id) {
                return Err(Error::Validation(format!("duplicate agent id '{id}'")));
            }
            agents.insert(id.clone(), agent.clone());
        }

        TraceEvent::AgentCreated {
            agent_id: id.clone(),
            parent_ceiling: format!("{capped_level:?}"),
        }
        .emit();

        Ok(summarize(&agent))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().get(id).cloned()
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.agents.read().values().map(|a| summarize(a)).collect()
    }

    pub fn destroy_agent(&self, id: &str) -> Result<()> {
        let agent = self.agents.write().remove(id);
        match agent {
            Some(agent) => {
                agent.cancel_all();
                TraceEvent::AgentDestroyed {
                    agent_id: id.to_string(),
                    reason: "destroy_agent".to_string(),
                }
                .emit();
                Ok(())
            }
            None => Err(agent_not_found(id)),
        }
    }

    pub async fn shutdown_server(&self) {
        let ids: Vec<String> = self.agents.read().keys().cloned().collect();
        for id in ids {
            let _ = self.destroy_agent(&id);
        }
        self.resources.mcp.shutdown().await;
    }

    fn generate_id(&self) -> String {
        loop {
            let id: String = {
                let mut rng = rand::thread_rng();
                (0..8).map(|_| rng.sample(rand::distributions::Alphanumeric) as char).collect::<String>().to_ascii_lowercase()
            };
            if !self.agents.read().contains_key(&id) {
                return id;
            }
        }
    }
}

fn depth_exceeds_limit(parent_depth: u32, agents_config: &AgentsConfig) -> bool {
    parent_depth + 1 > agents_config.limits.max_depth
}

fn summarize(agent: &Agent) -> AgentSummary {
    AgentSummary {
        id: agent.id.clone(),
        owner_id: agent.owner_id.clone(),
        depth: agent.depth,
        created_at: agent.created_at,
        permission_level: agent.permission_level(),
        message_count: agent.context.message_count(),
    }
}

/// Agent ids are caller-supplied and end up in log lines, file paths
/// under the agent's working directory, and MCP visibility keys — keep
/// them to a conservative, unambiguous grammar.
fn validate_agent_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(Error::Validation("agent id must be 1-64 characters".to_string()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(Error::Validation(
            "agent id may only contain ascii letters, digits, '-', and '_'".to_string(),
        ));
    }
    Ok(())
}

fn agent_not_found(id: &str) -> Error {
    Error::Validation(format!("agent '{id}' not found"))
}

/// Whether an `Error` returned by pool/dispatcher code represents an
/// agent-lookup failure, so the transport can map it to
/// `RPC_CODE_AGENT_NOT_FOUND` instead of the generic validation code.
pub fn is_agent_not_found(err: &Error) -> bool {
    matches!(err, Error::Validation(msg) if msg.contains("not found"))
}

pub fn is_duplicate_agent_id(err: &Error) -> bool {
    matches!(err, Error::Validation(msg) if msg.contains("duplicate agent id"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-agent dispatcher (spec §4.10)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentDispatcher<'a> {
    agent: Arc<Agent>,
    resources: &'a PoolResources,
}

impl<'a> AgentDispatcher<'a> {
    pub fn new(agent: Arc<Agent>, resources: &'a PoolResources) -> Self {
        Self { agent, resources }
    }

    /// Runs one turn to completion. Serialized per agent via
    /// `send_lock` so two overlapping `send` calls can't race on the
    /// context log.
    pub async fn send(&self, message: String, request_id: String, events: mpsc::Sender<TurnEvent>) -> Result<Message> {
        let _guard = self.agent.send_lock.lock().await;

        let pending = self.agent.take_pending_cancelled();
        if !pending.is_empty() {
            turn::flush_pending_cancelled(&self.agent.context, pending);
        }

        let token = self.agent.begin_request(request_id.clone());

        TraceEvent::TurnStarted {
            agent_id: self.agent.id.clone(),
            request_id: request_id.clone(),
        }
        .emit();

        let ctx = TurnRunContext {
            agent_id: self.agent.id.clone(),
            owner_id: self.agent.owner_id.clone(),
            router: self.resources.router.clone(),
            context: self.agent.context.clone(),
            registry: self.resources.registry.clone(),
            mcp: self.resources.mcp.clone(),
            tool_policy: self.agent.tool_policy.clone(),
            policy: self.agent.policy_snapshot(),
            ceilings: self.agent.ceilings.clone(),
            max_iterations: 10,
            max_concurrent_tools: 10,
        };

        let result = turn::run_turn(&ctx, message, token.cancellation.clone(), events).await;

        self.agent.end_request(&request_id);

        TraceEvent::TurnCompleted {
            agent_id: self.agent.id.clone(),
            request_id,
            iterations: 0,
            outcome: if result.is_ok() { "completed".to_string() } else { "error".to_string() },
        }
        .emit();

        result
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.agent.cancel_request(request_id)
    }

    /// Record an MCP per-tool/per-server consent choice against this
    /// agent's live policy (spec §4.6). Takes effect starting with the
    /// next `send` — a turn already in flight runs against the policy
    /// snapshot it started with.
    pub fn grant_mcp_consent(&self, server_name: &str, tool_name: &str, choice: nexus3_mcp::ConsentChoice) {
        self.agent.record_mcp_consent(server_name, tool_name, choice);
    }

    pub fn get_tokens(&self) -> TokenReport {
        let defs = self
            .resources
            .registry
            .get_definitions(&self.agent.tool_policy, &self.agent.id, &self.agent.owner_id);
        let def_values: Vec<serde_json::Value> = defs.iter().map(nexus3_domain::tool::ToolDescriptor::to_definition).collect();
        let tool_tokens = nexus3_domain::tokens::count_tool_definitions(&def_values);
        self.agent.context.get_tokens(tool_tokens)
    }

    pub fn get_context(&self) -> (usize, bool) {
        (self.agent.context.message_count(), !self.agent.context.system_prompt().is_empty())
    }

    pub async fn compact(&self) -> Result<()> {
        let before = self.get_tokens().total;
        let outcome = compact_agent(&self.agent, &self.resources.router).await;
        let after = self.get_tokens().total;
        TraceEvent::CompactionRun {
            agent_id: self.agent.id.clone(),
            before_tokens: before,
            after_tokens: after,
            fallback_truncation: outcome.is_err(),
        }
        .emit();
        outcome
    }

    pub fn shutdown(&self) -> Result<()> {
        self.agent.cancel_all();
        Ok(())
    }
}

async fn compact_agent(agent: &Agent, router: &LlmRouter) -> Result<()> {
    // `prepare_turn` already folds compaction + truncation into the act
    // of building a turn's message list; `compact` forces that same
    // path on demand without actually sending anything.
    let _ = agent.context.prepare_turn(router, 0).await;
    Ok(())
}
