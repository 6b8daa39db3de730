//! Per-agent state (spec §4.9, §4.11).
//!
//! One `Agent` exists per live agent in the pool. It owns its own
//! context log, permission policy, and in-flight bookkeeping; everything
//! it needs to actually run a turn (the provider router, the tool
//! registry, the MCP manager) is shared from the pool and passed in by
//! the dispatcher rather than duplicated per agent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use nexus3_domain::cancel::RequestToken;
use nexus3_domain::config::ToolPolicy;
use nexus3_domain::permission::PermissionPolicy;
use nexus3_domain::tool::ToolCall;
use nexus3_mcp::ConsentChoice;

use crate::context::ContextManager;

pub struct Agent {
    pub id: String,
    /// The top-level agent a chain of `create_agent` calls descends
    /// from; used for MCP's private/shared tool visibility, not for
    /// permission ceilings (those are tracked separately in `ceilings`).
    pub owner_id: String,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub tool_policy: ToolPolicy,
    /// Locked so consent grants (`record_mcp_consent`) can mutate it from
    /// a live `Arc<Agent>` without a `send` in flight.
    policy: Mutex<PermissionPolicy>,
    /// Flattened chain of ancestor policies, nearest ancestor last,
    /// every one of which this agent's calls must also satisfy.
    pub ceilings: Vec<PermissionPolicy>,
    pub context: Arc<ContextManager>,
    /// Serializes `send` calls for this agent so two overlapping
    /// requests can never interleave its context log.
    pub send_lock: AsyncMutex<()>,
    pub in_flight: Mutex<HashMap<String, RequestToken>>,
    /// Tool calls left unanswered by a turn that was cancelled mid
    /// tool-batch; flushed into synthetic failed results at the start
    /// of the next `send`.
    pub pending_cancelled: Mutex<Vec<ToolCall>>,
}

impl Agent {
    pub fn new(
        id: String,
        owner_id: String,
        depth: u32,
        tool_policy: ToolPolicy,
        policy: PermissionPolicy,
        ceilings: Vec<PermissionPolicy>,
        context: Arc<ContextManager>,
    ) -> Self {
        Self {
            id,
            owner_id,
            depth,
            created_at: Utc::now(),
            tool_policy,
            policy: Mutex::new(policy),
            ceilings,
            context,
            send_lock: AsyncMutex::new(()),
            in_flight: Mutex::new(HashMap::new()),
            pending_cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn begin_request(&self, request_id: String) -> RequestToken {
        let token = RequestToken::new(request_id.clone());
        self.in_flight.lock().insert(request_id, token.clone());
        token
    }

    pub fn end_request(&self, request_id: &str) {
        self.in_flight.lock().remove(request_id);
    }

    pub fn cancel_request(&self, request_id: &str) -> bool {
        if let Some(token) = self.in_flight.lock().get(request_id) {
            token.cancellation.cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every in-flight request — used when the agent itself is
    /// being destroyed.
    pub fn cancel_all(&self) {
        for token in self.in_flight.lock().values() {
            token.cancellation.cancel();
        }
    }

    pub fn take_pending_cancelled(&self) -> Vec<ToolCall> {
        std::mem::take(&mut self.pending_cancelled.lock())
    }

    pub fn stash_pending_cancelled(&self, calls: Vec<ToolCall>) {
        self.pending_cancelled.lock().extend(calls);
    }

    /// Snapshot of this agent's current policy — cloned so a turn runs
    /// against a fixed view even if a consent grant lands mid-turn.
    pub fn policy_snapshot(&self) -> PermissionPolicy {
        self.policy.lock().clone()
    }

    pub fn permission_level(&self) -> nexus3_domain::permission::PermissionLevel {
        self.policy.lock().level()
    }

    pub fn max_spawnable_level(&self) -> Option<nexus3_domain::permission::PermissionLevel> {
        self.policy.lock().max_spawnable_level()
    }

    /// Applies an MCP consent choice to this agent's live policy (spec
    /// §4.6) — the only way `record_consent` is reachable from a real
    /// caller rather than just its own unit tests.
    pub fn record_mcp_consent(&self, server_name: &str, tool_name: &str, choice: ConsentChoice) {
        let mut policy = self.policy.lock();
        nexus3_mcp::record_consent(&mut policy, server_name, tool_name, choice);
    }
}
