//! Permission engine (spec §4.4).
//!
//! Resolution order for a single tool call:
//! 1. `disabled_tools` → always Deny, no matter the level.
//! 2. Level-based base policy (YOLO allows everything; SANDBOXED denies
//!    unless the call matches an allowed path/host and passes the
//!    sandbox validator; TRUSTED allows reads and requires confirmation
//!    on writes/network unless a session allowance already covers it).
//! 3. A per-tool override can only *upgrade* the base decision (grant
//!    where the base would deny or require confirmation), never
//!    downgrade it.
//! 4. The result is intersected with `parent_ceiling`'s own decision for
//!    the same call — a child can never be more permissive than its
//!    parent, regardless of its own level or overrides.

use crate::tool::PermissionGate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    /// Most restrictive: deny unless explicitly allowed.
    Sandboxed,
    /// Reads generally allowed, writes/network need confirmation or an
    /// explicit session allowance.
    Trusted,
    /// Least restrictive: allow everything the base level doesn't
    /// itself forbid via `disabled_tools`.
    Yolo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
    RequireConfirmation(String),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Intersect two decisions for the same call: the more restrictive
    /// of the two wins. Ordering: Deny > RequireConfirmation > Allow.
    pub fn intersect(self, other: Decision) -> Decision {
        use Decision::*;
        match (self, other) {
            (Deny(r), _) | (_, Deny(r)) => Deny(r),
            (RequireConfirmation(r), _) | (_, RequireConfirmation(r)) => RequireConfirmation(r),
            (Allow, Allow) => Allow,
        }
    }
}

/// What a single call is attempting to do, for the engine to classify
/// against path/network allowances.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub gate: PermissionGate,
    pub is_write: bool,
    pub requests_network: bool,
    /// A stable hash identifying *why* this call needs confirmation
    /// (e.g. tool name + target path), used to key session allowances.
    pub reason_hash: Option<String>,
    /// The filesystem path this call actually targets, when the tool's
    /// arguments name one. `FileAccess`-gated calls with no resolvable
    /// target path are denied outright under SANDBOXED/TRUSTED — there is
    /// nothing to run the sandbox validator against.
    pub target_path: Option<String>,
    /// The URL this call actually targets, when the tool's arguments name
    /// one. Same fail-closed rule as `target_path`.
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub level: Option<PermissionLevelOrDefault>,
    #[serde(default)]
    pub allowed_read_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allowed_write_paths: Vec<PathBuf>,
    #[serde(default)]
    pub network_allowed: bool,
    #[serde(default)]
    pub disabled_tools: HashSet<String>,
    /// Per-tool overrides; may only raise the effective decision, never
    /// lower it below what the base level would already allow.
    #[serde(default)]
    pub per_tool_overrides: HashMap<String, PermissionLevel>,
    /// Confirmed-once allowances for this agent's lifetime, keyed by
    /// `CallContext::reason_hash`. Never inherited by child agents and
    /// never shared across agents even when tools are.
    #[serde(skip)]
    pub session_allowances: HashSet<String>,
}

/// Placeholder so `PermissionPolicy` can `derive(Default)` even though
/// `PermissionLevel` has no natural default; callers are expected to set
/// `level` explicitly when constructing a policy outside of `Default`.
pub type PermissionLevelOrDefault = PermissionLevel;

impl PermissionPolicy {
    pub fn new(level: PermissionLevel) -> Self {
        Self {
            level: Some(level),
            allowed_read_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            network_allowed: false,
            disabled_tools: HashSet::new(),
            per_tool_overrides: HashMap::new(),
            session_allowances: HashSet::new(),
        }
    }

    pub fn level(&self) -> PermissionLevel {
        self.level.unwrap_or(PermissionLevel::Sandboxed)
    }

    pub fn allow_for_session(&mut self, reason_hash: impl Into<String>) {
        self.session_allowances.insert(reason_hash.into());
    }

    fn has_session_allowance(&self, ctx: &CallContext) -> bool {
        ctx.reason_hash
            .as_ref()
            .is_some_and(|h| self.session_allowances.contains(h))
    }

    /// Base decision from this policy's own level/paths/disabled list,
    /// ignoring any parent ceiling.
    fn base_decision(&self, tool_name: &str, ctx: &CallContext) -> Decision {
        if self.disabled_tools.contains(tool_name) {
            return Decision::Deny(format!("tool '{tool_name}' is disabled for this agent"));
        }

        let level = self.level();
        let base = match level {
            PermissionLevel::Yolo => Decision::Allow,
            PermissionLevel::Sandboxed => {
                if self.has_session_allowance(ctx) {
                    Decision::Allow
                } else {
                    match ctx.gate {
                        PermissionGate::None => Decision::Allow,
                        PermissionGate::FileAccess => {
                            if self.path_allowed(ctx) {
                                Decision::Allow
                            } else {
                                Decision::Deny("sandboxed agent has no allowance for this path".to_string())
                            }
                        }
                        PermissionGate::Network => {
                            if self.network_allowed_for(ctx) {
                                Decision::Allow
                            } else {
                                Decision::Deny("sandboxed agent has no network allowance for this target".to_string())
                            }
                        }
                        PermissionGate::Always => {
                            Decision::Deny("tool always requires explicit permission".to_string())
                        }
                    }
                }
            }
            PermissionLevel::Trusted => {
                if self.has_session_allowance(ctx) {
                    Decision::Allow
                } else {
                    match ctx.gate {
                        PermissionGate::None => Decision::Allow,
                        PermissionGate::FileAccess if !ctx.is_write => Decision::Allow,
                        PermissionGate::FileAccess => {
                            Decision::RequireConfirmation("write access requires confirmation".to_string())
                        }
                        PermissionGate::Network => {
                            if self.network_allowed_for(ctx) {
                                Decision::Allow
                            } else {
                                Decision::RequireConfirmation("network access requires confirmation".to_string())
                            }
                        }
                        PermissionGate::Always => {
                            Decision::RequireConfirmation("tool always requires confirmation".to_string())
                        }
                    }
                }
            }
        };

        // Per-tool override can only upgrade.
        if let Some(&override_level) = self.per_tool_overrides.get(tool_name) {
            let upgraded = match override_level {
                PermissionLevel::Yolo => Decision::Allow,
                PermissionLevel::Trusted if matches!(base, Decision::Deny(_)) => {
                    Decision::RequireConfirmation(format!("override upgrades '{tool_name}' to trusted"))
                }
                _ => base.clone(),
            };
            return more_permissive(base, upgraded);
        }

        base
    }

    /// Runs the call's actual target path through `sandbox::validate_path`
    /// against the roots this level permits. A call with no resolvable
    /// target path is denied — an empty allowance list used to be the
    /// only thing checked here, which let any path through once an
    /// operator configured even one allowed root.
    fn path_allowed(&self, ctx: &CallContext) -> bool {
        let Some(target) = ctx.target_path.as_deref() else {
            return false;
        };
        let roots: Vec<PathBuf> = if ctx.is_write {
            self.allowed_write_paths.clone()
        } else {
            self.allowed_read_paths.iter().chain(self.allowed_write_paths.iter()).cloned().collect()
        };
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"));
        crate::sandbox::validate_path(&roots, target, &home).is_ok()
    }

    /// Runs the call's actual target URL through `sandbox::validate_url`.
    /// A call with no resolvable target URL is denied even when
    /// `network_allowed` is set.
    fn network_allowed_for(&self, ctx: &CallContext) -> bool {
        self.network_allowed && ctx.target_url.as_deref().is_some_and(|url| crate::sandbox::validate_url(url).is_ok())
    }

    /// The highest `PermissionLevel` this policy is allowed to grant a
    /// spawned child agent, per spec §4.4's parent-ceiling rule: TRUSTED
    /// may only spawn SANDBOXED children, SANDBOXED may spawn none, and
    /// YOLO may spawn up to TRUSTED.
    pub fn max_spawnable_level(&self) -> Option<PermissionLevel> {
        match self.level() {
            PermissionLevel::Yolo => Some(PermissionLevel::Trusted),
            PermissionLevel::Trusted => Some(PermissionLevel::Sandboxed),
            PermissionLevel::Sandboxed => None,
        }
    }
}

fn more_permissive(a: Decision, b: Decision) -> Decision {
    use Decision::*;
    fn rank(d: &Decision) -> u8 {
        match d {
            Deny(_) => 0,
            RequireConfirmation(_) => 1,
            Allow => 2,
        }
    }
    if rank(&b) >= rank(&a) {
        b
    } else {
        a
    }
}

/// A policy together with the chain of ceilings it must be intersected
/// against — the effective policy for a call is this policy's own
/// decision ANDed with every ancestor's decision for the same call.
pub struct EffectivePolicy<'a> {
    pub own: &'a PermissionPolicy,
    pub ceilings: Vec<&'a PermissionPolicy>,
}

impl<'a> EffectivePolicy<'a> {
    pub fn decide(&self, tool_name: &str, ctx: &CallContext) -> Decision {
        let mut decision = self.own.base_decision(tool_name, ctx);
        for ceiling in &self.ceilings {
            decision = decision.intersect(ceiling.base_decision(tool_name, ctx));
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(gate: PermissionGate) -> CallContext {
        CallContext {
            gate,
            is_write: false,
            requests_network: false,
            reason_hash: None,
            target_path: None,
            target_url: None,
        }
    }

    #[test]
    fn yolo_allows_everything_not_disabled() {
        let policy = PermissionPolicy::new(PermissionLevel::Yolo);
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(eff.decide("exec", &ctx(PermissionGate::Always)).is_allow());
    }

    #[test]
    fn disabled_tool_denies_even_under_yolo() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Yolo);
        policy.disabled_tools.insert("exec".to_string());
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(matches!(eff.decide("exec", &ctx(PermissionGate::None)), Decision::Deny(_)));
    }

    #[test]
    fn sandboxed_denies_file_access_without_allowance() {
        let policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(matches!(
            eff.decide("read_file", &ctx(PermissionGate::FileAccess)),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn sandboxed_allows_file_access_with_configured_path() {
        let ws = tempfile::TempDir::new().unwrap();
        std::fs::write(ws.path().join("a.txt"), "x").unwrap();
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.allowed_read_paths.push(ws.path().to_path_buf());
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        let call_ctx = CallContext {
            target_path: Some(ws.path().join("a.txt").to_string_lossy().into_owned()),
            ..ctx(PermissionGate::FileAccess)
        };
        assert!(eff.decide("read_file", &call_ctx).is_allow());
    }

    #[test]
    fn sandboxed_denies_path_outside_configured_root_even_once_one_is_set() {
        let ws = tempfile::TempDir::new().unwrap();
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.allowed_write_paths.push(ws.path().to_path_buf());
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        let call_ctx = CallContext {
            is_write: true,
            target_path: Some("/etc/passwd".to_string()),
            ..ctx(PermissionGate::FileAccess)
        };
        assert!(matches!(eff.decide("write_file", &call_ctx), Decision::Deny(_)));
    }

    #[test]
    fn sandboxed_denies_network_without_a_target_url() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.network_allowed = true;
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(matches!(
            eff.decide("fetch", &ctx(PermissionGate::Network)),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn sandboxed_denies_network_to_a_blocked_target() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.network_allowed = true;
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        let call_ctx = CallContext {
            target_url: Some("http://169.254.169.254/latest/meta-data/".to_string()),
            ..ctx(PermissionGate::Network)
        };
        assert!(matches!(eff.decide("fetch", &call_ctx), Decision::Deny(_)));
    }

    #[test]
    fn sandboxed_allows_network_to_an_allowed_public_target() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.network_allowed = true;
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        let call_ctx = CallContext {
            target_url: Some("https://api.example.com/v1".to_string()),
            ..ctx(PermissionGate::Network)
        };
        assert!(eff.decide("fetch", &call_ctx).is_allow());
    }

    #[test]
    fn trusted_allows_reads_requires_confirmation_on_writes() {
        let policy = PermissionPolicy::new(PermissionLevel::Trusted);
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(eff.decide("read_file", &ctx(PermissionGate::FileAccess)).is_allow());

        let write_ctx = CallContext {
            is_write: true,
            ..ctx(PermissionGate::FileAccess)
        };
        assert!(matches!(
            eff.decide("write_file", &write_ctx),
            Decision::RequireConfirmation(_)
        ));
    }

    #[test]
    fn session_allowance_unlocks_trusted_write() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Trusted);
        let write_ctx = CallContext {
            is_write: true,
            reason_hash: Some("write:/tmp/x".to_string()),
            ..ctx(PermissionGate::FileAccess)
        };
        {
            let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
            assert!(matches!(eff.decide("write_file", &write_ctx), Decision::RequireConfirmation(_)));
        }
        policy.allow_for_session("write:/tmp/x");
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(eff.decide("write_file", &write_ctx).is_allow());
    }

    #[test]
    fn parent_ceiling_caps_a_more_permissive_child() {
        let child = PermissionPolicy::new(PermissionLevel::Yolo);
        let ceiling = PermissionPolicy::new(PermissionLevel::Sandboxed);
        let eff = EffectivePolicy {
            own: &child,
            ceilings: vec![&ceiling],
        };
        assert!(matches!(
            eff.decide("exec", &ctx(PermissionGate::Always)),
            Decision::Deny(_)
        ));
    }

    #[test]
    fn trusted_can_only_spawn_sandboxed_children() {
        let policy = PermissionPolicy::new(PermissionLevel::Trusted);
        assert_eq!(policy.max_spawnable_level(), Some(PermissionLevel::Sandboxed));
    }

    #[test]
    fn sandboxed_cannot_spawn_children() {
        let policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        assert_eq!(policy.max_spawnable_level(), None);
    }

    #[test]
    fn per_tool_override_upgrades_but_never_downgrades() {
        let mut policy = PermissionPolicy::new(PermissionLevel::Sandboxed);
        policy.per_tool_overrides.insert("echo".to_string(), PermissionLevel::Yolo);
        let eff = EffectivePolicy { own: &policy, ceilings: vec![] };
        assert!(eff.decide("echo", &ctx(PermissionGate::Always)).is_allow());
        // A different, non-overridden tool remains denied.
        assert!(matches!(
            eff.decide("exec", &ctx(PermissionGate::Always)),
            Decision::Deny(_)
        ));
    }
}
