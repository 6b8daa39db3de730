use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context manager & compactor (spec §3, §4.7) — token-budget window.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Total token budget the provider's context window supports.
    #[serde(default = "d_max_tokens")]
    pub max_tokens: usize,
    /// Tokens held back for the provider's own completion, never filled
    /// with conversation history.
    #[serde(default = "d_reserve_tokens")]
    pub reserve_tokens: usize,
    /// Compaction triggers once `count_tokens(messages) > trigger_ratio
    /// * available`, where `available = max_tokens - reserve_tokens -
    /// tokens(system_prompt) - tokens(tool_definitions)`.
    #[serde(default = "d_trigger_ratio")]
    pub trigger_ratio: f64,
    /// Upper bound on the compactor's summary, as a fraction of `available`.
    #[serde(default = "d_summary_budget_ratio")]
    pub summary_budget_ratio: f64,
    /// Minimum fraction of `available` the recent-tail must retain
    /// uncompacted.
    #[serde(default = "d_recent_preserve_ratio")]
    pub recent_preserve_ratio: f64,
    /// Model used to produce compaction summaries, if different from the
    /// agent's main model. Falls back to the "compactor" role, then the
    /// agent's own model, when unset.
    #[serde(default)]
    pub compactor_model: Option<String>,
    /// Strategy used when compaction itself fails and the context must
    /// still be brought under budget.
    #[serde(default)]
    pub truncation_strategy: TruncationStrategy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: d_max_tokens(),
            reserve_tokens: d_reserve_tokens(),
            trigger_ratio: d_trigger_ratio(),
            summary_budget_ratio: d_summary_budget_ratio(),
            recent_preserve_ratio: d_recent_preserve_ratio(),
            compactor_model: None,
            truncation_strategy: TruncationStrategy::default(),
        }
    }
}

impl ContextConfig {
    pub fn available_tokens(&self, system_prompt_tokens: usize, tool_def_tokens: usize) -> usize {
        self.max_tokens
            .saturating_sub(self.reserve_tokens)
            .saturating_sub(system_prompt_tokens)
            .saturating_sub(tool_def_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    #[default]
    OldestFirst,
    MiddleOut,
}

fn d_max_tokens() -> usize {
    128_000
}
fn d_reserve_tokens() -> usize {
    4_096
}
fn d_trigger_ratio() -> f64 {
    0.85
}
fn d_summary_budget_ratio() -> f64 {
    0.15
}
fn d_recent_preserve_ratio() -> f64 {
    0.25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_tokens_subtracts_reserve_and_overhead() {
        let cfg = ContextConfig {
            max_tokens: 10_000,
            reserve_tokens: 1_000,
            ..ContextConfig::default()
        };
        assert_eq!(cfg.available_tokens(500, 200), 10_000 - 1_000 - 500 - 200);
    }

    #[test]
    fn available_tokens_saturates_at_zero() {
        let cfg = ContextConfig {
            max_tokens: 1_000,
            reserve_tokens: 900,
            ..ContextConfig::default()
        };
        assert_eq!(cfg.available_tokens(200, 200), 0);
    }

    #[test]
    fn default_ratios_are_between_zero_and_one() {
        let cfg = ContextConfig::default();
        assert!(cfg.trigger_ratio > 0.0 && cfg.trigger_ratio < 1.0);
        assert!(cfg.summary_budget_ratio > 0.0 && cfg.summary_budget_ratio < 1.0);
        assert!(cfg.recent_preserve_ratio > 0.0 && cfg.recent_preserve_ratio < 1.0);
    }
}
