use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON-RPC transport server (spec §4.12) — localhost-bind-only.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_3210")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3210,
            host: "127.0.0.1".into(),
        }
    }
}

impl ServerConfig {
    /// The transport binds to loopback only, per spec §4.12 ("enforced
    /// at socket bind, other host = fatal config error"). Checked both
    /// here (for `Config::validate`) and again right before `bind()`.
    pub fn is_loopback_host(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

fn d_3210() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host_is_loopback() {
        assert!(ServerConfig::default().is_loopback_host());
    }

    #[test]
    fn non_loopback_host_is_rejected() {
        let cfg = ServerConfig {
            port: 3210,
            host: "0.0.0.0".into(),
        };
        assert!(!cfg.is_loopback_host());
    }
}
