use crate::permission::{PermissionLevel, PermissionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permission policy presets (spec §4.4) — named templates a
// `create_agent` call or the `sandboxed`/`trusted`/`yolo` CLI flags
// resolve against. Distinct from `crate::permission`, which holds the
// decision engine itself.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Named policy templates, keyed by preset name. Seeded with
    /// `sandboxed`, `trusted`, `yolo`, `worker` on `Default`; entries in
    /// the loaded config file merge into (and may overwrite) these.
    #[serde(default = "default_presets")]
    pub presets: HashMap<String, PermissionPolicy>,
    /// Preset applied to the top-level agent when the caller doesn't
    /// request one explicitly.
    #[serde(default = "d_default_preset")]
    pub default_preset: String,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            presets: default_presets(),
            default_preset: d_default_preset(),
        }
    }
}

impl PermissionConfig {
    pub fn preset(&self, name: &str) -> Option<&PermissionPolicy> {
        self.presets.get(name)
    }
}

fn default_presets() -> HashMap<String, PermissionPolicy> {
    let mut presets = HashMap::new();
    presets.insert("sandboxed".into(), PermissionPolicy::new(PermissionLevel::Sandboxed));
    presets.insert("trusted".into(), PermissionPolicy::new(PermissionLevel::Trusted));
    presets.insert("yolo".into(), PermissionPolicy::new(PermissionLevel::Yolo));
    // A worker preset is sandboxed by default; deployments that spawn
    // batch workers typically narrow allowed_read_paths further still.
    presets.insert("worker".into(), PermissionPolicy::new(PermissionLevel::Sandboxed));
    presets
}

fn d_default_preset() -> String {
    "sandboxed".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_four_builtin_presets() {
        let cfg = PermissionConfig::default();
        assert_eq!(cfg.presets.len(), 4);
        assert!(cfg.preset("yolo").is_some());
    }

    #[test]
    fn default_preset_name_resolves_to_sandboxed_policy() {
        let cfg = PermissionConfig::default();
        let preset = cfg.preset(&cfg.default_preset).expect("default preset must exist");
        assert_eq!(preset.level(), PermissionLevel::Sandboxed);
    }

    #[test]
    fn unknown_preset_name_returns_none() {
        let cfg = PermissionConfig::default();
        assert!(cfg.preset("does-not-exist").is_none());
    }
}
