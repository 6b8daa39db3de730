//! Role-based LLM routing.
//!
//! Resolves a [`ModelRole`] to a configured provider/model pair, checks
//! that the provider advertises the capabilities the role requires, and
//! wraps the call with the configured timeout. No fallback chains: a
//! role names exactly one model spec (spec §4.8 routes by role, not by
//! provider availability).

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, LlmProvider};
use nexus3_domain::capability::{ModelRole, ToolSupport};
use nexus3_domain::config::LlmConfig;
use nexus3_domain::error::{Error, Result};
use nexus3_domain::stream::{BoxStream, StreamEvent};
use nexus3_domain::tool::Message;
use nexus3_domain::trace::TraceEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn role_to_string(role: ModelRole) -> &'static str {
    match role {
        ModelRole::Executor => "executor",
        ModelRole::Compactor => "compactor",
    }
}

pub struct LlmRouter {
    registry: Arc<ProviderRegistry>,
    default_timeout: Duration,
}

impl LlmRouter {
    pub fn new(registry: Arc<ProviderRegistry>, config: &LlmConfig) -> Self {
        Self { registry, default_timeout: Duration::from_millis(config.default_timeout_ms) }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn resolve(&self, role: ModelRole, req: &ChatRequest) -> Result<(Arc<dyn LlmProvider>, ChatRequest)> {
        let role_name = role_to_string(role);
        let provider = self
            .registry
            .for_role(role_name)
            .ok_or_else(|| Error::Config(format!("no provider configured for role '{role_name}'")))?;

        let model = self.registry.model_for_role(role_name).map(|s| s.to_string());
        let mut req = req.clone();
        if req.model.is_none() {
            req.model = model;
        }

        let caps = provider.capabilities();
        if !req.tools.is_empty() && caps.supports_tools == ToolSupport::None {
            return Err(Error::Config(format!(
                "role '{role_name}' requires tool support but provider '{}' does not support tools",
                provider.provider_id()
            )));
        }

        Ok((provider, req))
    }

    /// Send a request for the given role and wait for the final message.
    pub async fn complete_for_role(&self, role: ModelRole, req: ChatRequest) -> Result<Message> {
        let (provider, req) = self.resolve(role, &req)?;
        let model = req.model.clone().unwrap_or_default();
        let started = Instant::now();

        let result = tokio::time::timeout(self.default_timeout, provider.complete(req))
            .await
            .map_err(|_| Error::Timeout(format!("provider '{}' timed out", provider.provider_id())))?;

        TraceEvent::ProviderRequest {
            provider: provider.provider_id().to_string(),
            model,
            streaming: false,
            duration_ms: started.elapsed().as_millis() as u64,
            prompt_tokens: None,
            completion_tokens: None,
        }
        .emit();

        result
    }

    /// Open a stream for the given role. The stream itself is not subject
    /// to `default_timeout`; a caller enforces per-turn or per-call
    /// timeouts by dropping the stream (spec §4.8, "Cancellation").
    pub async fn stream_for_role(
        &self,
        role: ModelRole,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let (provider, req) = self.resolve(role, &req)?;
        let model = req.model.clone().unwrap_or_default();
        let provider_id = provider.provider_id().to_string();

        let result = tokio::time::timeout(self.default_timeout, provider.stream(req))
            .await
            .map_err(|_| Error::Timeout(format!("provider '{provider_id}' timed out opening stream")))?;

        TraceEvent::ProviderRequest {
            provider: provider_id,
            model,
            streaming: true,
            duration_ms: 0,
            prompt_tokens: None,
            completion_tokens: None,
        }
        .emit();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_match_config_role_keys() {
        assert_eq!(role_to_string(ModelRole::Executor), "executor");
        assert_eq!(role_to_string(ModelRole::Compactor), "compactor");
    }
}
