use crate::permission::PermissionLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Named agent presets (spec §4.9) — templates `create_agent` draws
// from when a caller names a preset instead of inlining every field.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    /// Preset name -> template. `create_agent` may reference a preset
    /// by name and override individual fields.
    #[serde(default)]
    pub presets: HashMap<String, AgentPreset>,
    /// Fan-out ceilings applied to every agent regardless of preset.
    #[serde(default)]
    pub limits: AgentLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPreset {
    /// Starting permission level (subject to the spawning agent's
    /// `parent_ceiling`, enforced by the dispatcher, not here).
    #[serde(default = "d_sandboxed")]
    pub permission_level: PermissionLevel,
    /// Tool name prefixes denied outright, evaluated before the
    /// permission engine's own per-tool overrides.
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Role -> model overrides for this preset, taking precedence over
    /// the global `[llm.roles]` map.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

impl Default for AgentPreset {
    fn default() -> Self {
        Self {
            permission_level: PermissionLevel::Sandboxed,
            tool_policy: ToolPolicy::default(),
            models: HashMap::new(),
        }
    }
}

fn d_sandboxed() -> PermissionLevel {
    PermissionLevel::Sandboxed
}

/// Hard ceilings on multi-agent fan-out to prevent runaway trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Maximum nesting depth (parent -> child -> grandchild). A
    /// top-level agent is depth 1; its child is depth 2.
    #[serde(default = "d_3")]
    pub max_depth: u32,
    /// Maximum number of `create_agent` calls within a single parent turn.
    #[serde(default = "d_5")]
    pub max_children_per_turn: u32,
    /// Wall-clock timeout per child run (milliseconds). 0 = no limit.
    #[serde(default = "d_30000")]
    pub max_duration_ms: u64,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children_per_turn: 5,
            max_duration_ms: 30_000,
        }
    }
}

/// Tool allow/deny policy — prefix-based matching, case-insensitive,
/// deny wins over allow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    /// Tool name prefixes this agent may use. Empty or `["*"]` = unrestricted.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Tool name prefixes this agent is denied (evaluated before allow).
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();

        for d in &self.deny {
            let d_lower = d.to_ascii_lowercase();
            if d_lower == "*" || name == d_lower || name.starts_with(&format!("{d_lower}.")) {
                return false;
            }
        }
        if self.allow.is_empty() || self.allow.iter().any(|a| a == "*") {
            return true;
        }
        for a in &self.allow {
            let a_lower = a.to_ascii_lowercase();
            if name == a_lower || name.starts_with(&format!("{a_lower}.")) {
                return true;
            }
        }
        false
    }
}

fn d_3() -> u32 {
    3
}
fn d_5() -> u32 {
    5
}
fn d_30000() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_policy_empty_allows_all() {
        let policy = ToolPolicy::default();
        assert!(policy.allows("exec"));
        assert!(policy.allows("file.read"));
    }

    #[test]
    fn tool_policy_allow_restricts() {
        let policy = ToolPolicy {
            allow: vec!["file".into()],
            deny: vec![],
        };
        assert!(policy.allows("file.read"));
        assert!(!policy.allows("exec"));
    }

    #[test]
    fn tool_policy_deny_takes_precedence() {
        let policy = ToolPolicy {
            allow: vec!["*".into()],
            deny: vec!["exec".into()],
        };
        assert!(!policy.allows("exec"));
        assert!(policy.allows("file.read"));
    }

    #[test]
    fn tool_policy_deny_star_blocks_all() {
        let policy = ToolPolicy {
            allow: vec!["exec".into()],
            deny: vec!["*".into()],
        };
        assert!(!policy.allows("exec"));
    }

    #[test]
    fn tool_policy_case_insensitive() {
        let policy = ToolPolicy {
            allow: vec!["File".into()],
            deny: vec![],
        };
        assert!(policy.allows("file.read"));
        assert!(policy.allows("FILE.WRITE"));
    }

    #[test]
    fn agent_limits_defaults() {
        let limits = AgentLimits::default();
        assert_eq!(limits.max_depth, 3);
        assert_eq!(limits.max_children_per_turn, 5);
        assert_eq!(limits.max_duration_ms, 30_000);
    }

    #[test]
    fn preset_default_is_sandboxed() {
        let preset = AgentPreset::default();
        assert_eq!(preset.permission_level, PermissionLevel::Sandboxed);
    }
}
