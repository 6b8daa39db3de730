mod agents;
mod context;
mod llm;
mod mcp;
mod permission;
mod server;
mod tools;

pub use agents::*;
pub use context::*;
pub use llm::*;
pub use mcp::*;
pub use permission::*;
pub use server::*;
pub use tools::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

fn is_agent_id_like(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        // ── Server ───────────────────────────────────────────────────
        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if !self.server.host.is_empty() && !self.server.is_loopback_host() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: format!(
                    "transport binds loopback only; \"{}\" is not 127.0.0.1, ::1, or localhost",
                    self.server.host
                ),
            });
        }

        // ── LLM providers ────────────────────────────────────────────
        if self.llm.providers.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no LLM providers configured".into(),
            });
        }
        if self.llm.providers.is_empty() && self.llm.startup_policy == LlmStartupPolicy::RequireOne
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "llm.startup_policy".into(),
                message: "require_one set but no providers are configured".into(),
            });
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: "provider id must not be empty".into(),
                });
            }
            if provider.base_url.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: "provider base_url must not be empty".into(),
                });
            }
            if !provider.base_url.is_empty()
                && !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: format!(
                        "base_url must start with http:// or https:// (got \"{}\")",
                        provider.base_url
                    ),
                });
            }
            if !provider.id.is_empty() && !seen_ids.insert(&provider.id) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.providers[{i}].id"),
                    message: format!(
                        "duplicate provider id \"{}\" — later provider will shadow earlier one",
                        provider.id
                    ),
                });
            }

            let needs_credentials =
                matches!(provider.auth.mode, AuthMode::ApiKey | AuthMode::QueryParam);
            if needs_credentials {
                let has_env = provider.auth.env.as_ref().is_some_and(|v| !v.is_empty());
                let has_key = provider.auth.key.as_ref().is_some_and(|v| !v.is_empty());
                if !has_env && !has_key {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("llm.providers[{i}].auth"),
                        message: format!(
                            "provider \"{}\" uses {:?} auth mode but has no auth.env or auth.key configured",
                            provider.id, provider.auth.mode
                        ),
                    });
                }
            }
        }

        // ── Context / compaction budget ──────────────────────────────
        if self.context.reserve_tokens >= self.context.max_tokens {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "context.reserve_tokens".into(),
                message: "reserve_tokens must be less than max_tokens".into(),
            });
        }
        for (field, ratio) in [
            ("context.trigger_ratio", self.context.trigger_ratio),
            ("context.summary_budget_ratio", self.context.summary_budget_ratio),
            ("context.recent_preserve_ratio", self.context.recent_preserve_ratio),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: field.into(),
                    message: format!("must be strictly between 0 and 1 (got {ratio})"),
                });
            }
        }
        if self.context.summary_budget_ratio + self.context.recent_preserve_ratio >= 1.0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "context.summary_budget_ratio".into(),
                message: "summary_budget_ratio + recent_preserve_ratio must leave room for the summary itself (< 1.0)".into(),
            });
        }

        // ── Exec security ────────────────────────────────────────────
        for (i, pattern) in self.tools.exec_security.denied_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("tools.exec_security.denied_patterns[{i}]"),
                    message: format!("invalid regex \"{pattern}\": {e}"),
                });
            }
        }

        // ── MCP servers ───────────────────────────────────────────────
        let mut seen_mcp_names: HashSet<&str> = HashSet::new();
        for (i, server) in self.mcp.servers.iter().enumerate() {
            if server.name.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].name"),
                    message: "server name must not be empty".into(),
                });
            }
            if server.name.contains(':') {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].name"),
                    message: "server name must not contain ':' (used as tool name delimiter)".into(),
                });
            }
            if !server.name.is_empty() && !seen_mcp_names.insert(&server.name) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("mcp.servers[{i}].name"),
                    message: format!("duplicate MCP server name \"{}\"", server.name),
                });
            }

            let has_command = server.command.as_ref().is_some_and(|c| !c.is_empty());
            let has_url = server.url.as_ref().is_some_and(|u| !u.is_empty());
            match server.transport {
                McpTransportKind::Stdio => {
                    if !has_command {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].command"),
                            message: "stdio transport requires a non-empty command".into(),
                        });
                    }
                    if has_url {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].url"),
                            message: "stdio transport must not set url".into(),
                        });
                    }
                }
                McpTransportKind::Sse => {
                    if !has_url {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].url"),
                            message: "sse transport requires a non-empty url".into(),
                        });
                    }
                    if has_command {
                        errors.push(ConfigError {
                            severity: ConfigSeverity::Error,
                            field: format!("mcp.servers[{i}].command"),
                            message: "sse transport must not set command".into(),
                        });
                    }
                }
            }

            for key in server.env.keys() {
                if matches!(key.as_str(), "LD_PRELOAD" | "LD_LIBRARY_PATH" | "DYLD_INSERT_LIBRARIES") {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("mcp.servers[{i}].env.{key}"),
                        message: format!("overriding {key} is not permitted for security"),
                    });
                }
            }
        }

        // ── Permission presets ───────────────────────────────────────
        if self.permission.preset(&self.permission.default_preset).is_none() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "permission.default_preset".into(),
                message: format!(
                    "default_preset \"{}\" is not defined in permission.presets",
                    self.permission.default_preset
                ),
            });
        }

        // ── Agent presets ─────────────────────────────────────────────
        for name in self.agents.presets.keys() {
            if !is_agent_id_like(name) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("agents.presets.{name}"),
                    message: "preset name must be 1-64 chars of [A-Za-z0-9_-]".into(),
                });
            }
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                port: 3210,
                host: "127.0.0.1".into(),
            },
            llm: LlmConfig {
                providers: vec![ProviderConfig {
                    id: "openai".into(),
                    kind: ProviderKind::OpenaiCompat,
                    base_url: "https://api.openai.com/v1".into(),
                    auth: AuthConfig {
                        mode: AuthMode::ApiKey,
                        env: Some("OPENAI_API_KEY".into()),
                        ..AuthConfig::default()
                    },
                    default_model: None,
                }],
                ..LlmConfig::default()
            },
            ..Config::default()
        }
    }

    fn find_issue<'a>(issues: &'a [ConfigError], field_prefix: &str) -> Option<&'a ConfigError> {
        issues.iter().find(|e| e.field.starts_with(field_prefix))
    }

    #[test]
    fn valid_config_passes() {
        let issues = valid_config().validate();
        let errors: Vec<_> = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn server_port_zero_is_error() {
        let mut cfg = valid_config();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert_eq!(find_issue(&issues, "server.port").unwrap().severity, ConfigSeverity::Error);
    }

    #[test]
    fn server_non_loopback_host_is_error() {
        let mut cfg = valid_config();
        cfg.server.host = "0.0.0.0".into();
        let issues = cfg.validate();
        let issue = find_issue(&issues, "server.host").expect("expected loopback error");
        assert_eq!(issue.severity, ConfigSeverity::Error);
        assert!(issue.message.contains("loopback"));
    }

    #[test]
    fn provider_base_url_invalid_scheme_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].base_url = "ws://localhost:1234".into();
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "llm.providers[0].base_url").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn provider_api_key_mode_no_credentials_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].auth = AuthConfig {
            mode: AuthMode::ApiKey,
            env: None,
            key: None,
            ..AuthConfig::default()
        };
        let issues = cfg.validate();
        let issue = find_issue(&issues, "llm.providers[0].auth").expect("expected auth error");
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn provider_none_auth_mode_no_credentials_is_ok() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].auth = AuthConfig {
            mode: AuthMode::None,
            env: None,
            key: None,
            ..AuthConfig::default()
        };
        let issues = cfg.validate();
        assert!(find_issue(&issues, "llm.providers[0].auth").is_none());
    }

    #[test]
    fn require_one_with_no_providers_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers.clear();
        cfg.llm.startup_policy = LlmStartupPolicy::RequireOne;
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "llm.startup_policy").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn duplicate_provider_ids_is_warning() {
        let mut cfg = valid_config();
        let mut second = cfg.llm.providers[0].clone();
        second.auth.env = Some("OPENAI_API_KEY_2".into());
        cfg.llm.providers.push(second);
        let issues = cfg.validate();
        let dup: Vec<_> = issues.iter().filter(|e| e.message.contains("duplicate provider id")).collect();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].severity, ConfigSeverity::Warning);
    }

    #[test]
    fn no_providers_is_warning() {
        let mut cfg = valid_config();
        cfg.llm.providers.clear();
        let issues = cfg.validate();
        assert_eq!(find_issue(&issues, "llm.providers").unwrap().severity, ConfigSeverity::Warning);
    }

    #[test]
    fn context_reserve_greater_than_max_is_error() {
        let mut cfg = valid_config();
        cfg.context.reserve_tokens = cfg.context.max_tokens;
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "context.reserve_tokens").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn context_ratio_out_of_bounds_is_error() {
        let mut cfg = valid_config();
        cfg.context.trigger_ratio = 1.5;
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "context.trigger_ratio").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn context_budget_ratios_overflow_is_error() {
        let mut cfg = valid_config();
        cfg.context.summary_budget_ratio = 0.6;
        cfg.context.recent_preserve_ratio = 0.6;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "context.summary_budget_ratio").is_some());
    }

    #[test]
    fn invalid_denied_pattern_is_error() {
        let mut cfg = valid_config();
        cfg.tools.exec_security.denied_patterns = vec![r"[invalid".into()];
        let issues = cfg.validate();
        let issue = find_issue(&issues, "tools.exec_security.denied_patterns[0]")
            .expect("expected regex error");
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn mcp_stdio_without_command_is_error() {
        let mut cfg = valid_config();
        cfg.mcp.servers.push(McpServerConfig {
            name: "fs".into(),
            transport: McpTransportKind::Stdio,
            command: None,
            args: vec![],
            url: None,
            env: Default::default(),
            visibility: McpVisibility::default(),
            consent: McpConsentMode::default(),
        });
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "mcp.servers[0].command").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn mcp_sse_without_url_is_error() {
        let mut cfg = valid_config();
        cfg.mcp.servers.push(McpServerConfig {
            name: "remote".into(),
            transport: McpTransportKind::Sse,
            command: None,
            args: vec![],
            url: None,
            env: Default::default(),
            visibility: McpVisibility::default(),
            consent: McpConsentMode::default(),
        });
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "mcp.servers[0].url").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn mcp_duplicate_names_is_error() {
        let mut cfg = valid_config();
        for _ in 0..2 {
            cfg.mcp.servers.push(McpServerConfig {
                name: "fs".into(),
                transport: McpTransportKind::Stdio,
                command: Some("npx".into()),
                args: vec![],
                url: None,
                env: Default::default(),
                visibility: McpVisibility::default(),
                consent: McpConsentMode::default(),
            });
        }
        let issues = cfg.validate();
        assert!(find_issue(&issues, "mcp.servers[1].name").is_some());
    }

    #[test]
    fn mcp_env_ld_preload_is_rejected() {
        let mut cfg = valid_config();
        let mut env = std::collections::HashMap::new();
        env.insert("LD_PRELOAD".into(), "evil.so".into());
        cfg.mcp.servers.push(McpServerConfig {
            name: "fs".into(),
            transport: McpTransportKind::Stdio,
            command: Some("npx".into()),
            args: vec![],
            url: None,
            env,
            visibility: McpVisibility::default(),
            consent: McpConsentMode::default(),
        });
        let issues = cfg.validate();
        assert!(find_issue(&issues, "mcp.servers[0].env.LD_PRELOAD").is_some());
    }

    #[test]
    fn permission_unknown_default_preset_is_error() {
        let mut cfg = valid_config();
        cfg.permission.default_preset = "does-not-exist".into();
        let issues = cfg.validate();
        assert_eq!(
            find_issue(&issues, "permission.default_preset").unwrap().severity,
            ConfigSeverity::Error
        );
    }

    #[test]
    fn agent_preset_name_with_invalid_chars_is_error() {
        let mut cfg = valid_config();
        cfg.agents.presets.insert("bad name!".into(), AgentPreset::default());
        let issues = cfg.validate();
        assert!(find_issue(&issues, "agents.presets.bad name!").is_some());
    }

    #[test]
    fn config_error_display_format() {
        let err = ConfigError {
            severity: ConfigSeverity::Error,
            field: "server.port".into(),
            message: "port must be greater than 0".into(),
        };
        assert_eq!(format!("{err}"), "[ERROR] server.port: port must be greater than 0");
    }
}
