use serde::Serialize;

/// Classifies a tool failure so callers (the turn engine, RPC error
/// mapping) can react without parsing the message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    ArgumentInvalid,
    PermissionDenied,
    SandboxViolation,
    Timeout,
    Cancelled,
    UnknownTool,
    Internal,
}

/// Shared error type used across all NEXUS3 crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A provider request failed. `retriable` distinguishes transient
    /// failures (429/5xx, connect/read errors) from fatal ones (401/403,
    /// malformed request) per the streaming client's retry policy.
    #[error("provider {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        retriable: bool,
    },

    /// A tool invocation failed. Always converted to a `ToolResult` before
    /// it reaches the turn engine's caller; never propagated as a panic.
    #[error("tool error ({kind:?}): {message}")]
    Tool {
        kind: ToolErrorKind,
        message: String,
    },

    #[error("transport: {0}")]
    Transport(#[source] std::io::Error),

    #[error("mcp: {0}")]
    Mcp(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Request validation failures (bad JSON-RPC params, invalid agent id,
    /// malformed tool arguments caught before dispatch). Never fatal to
    /// the process; always mapped to a JSON-RPC error response.
    #[error("validation: {0}")]
    Validation(String),

    /// An invariant the implementation itself is supposed to uphold was
    /// violated. The triggering turn/call fails, but the agent remains
    /// usable afterward.
    #[error("internal: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn tool(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Error::Tool {
            kind,
            message: message.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>, retriable: bool) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
            retriable,
        }
    }

    /// Whether a provider call that failed with this error should be
    /// retried by the streaming client's backoff loop.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Provider { retriable: true, .. } | Error::Timeout(_))
    }

    /// The JSON-RPC error code this error maps to, per the transport's
    /// domain code range (below -32000, reserved JSON-RPC codes handled
    /// separately by the transport layer itself).
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::Auth(_) => -32001,
            Error::Validation(_) => -32602,
            Error::Tool {
                kind: ToolErrorKind::PermissionDenied,
                ..
            } => -32004,
            Error::Tool {
                kind: ToolErrorKind::Timeout,
                ..
            } => -32005,
            Error::Tool {
                kind: ToolErrorKind::Cancelled,
                ..
            } => -32006,
            Error::Config(_) | Error::Internal(_) => -32603,
            _ => -32000,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_retriable_flag_drives_is_retriable() {
        let transient = Error::provider("openai", "rate limited", true);
        let fatal = Error::provider("openai", "bad api key", false);
        assert!(transient.is_retriable());
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn tool_permission_denied_maps_to_domain_code() {
        let e = Error::tool(ToolErrorKind::PermissionDenied, "write denied");
        assert_eq!(e.rpc_code(), -32004);
    }

    #[test]
    fn tool_cancelled_maps_to_domain_code() {
        let e = Error::tool(ToolErrorKind::Cancelled, "cancelled");
        assert_eq!(e.rpc_code(), -32006);
    }
}
