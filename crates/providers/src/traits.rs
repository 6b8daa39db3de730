use nexus3_domain::capability::LlmCapabilities;
use nexus3_domain::error::Result;
use nexus3_domain::stream::{BoxStream, StreamEvent};
use nexus3_domain::tool::{Message, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request — the `(messages,
/// tool_defs)` pair the streaming client's `complete`/`stream` take.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    /// Sampling temperature (0.0 - 2.0). `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait (spec §4.8)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements: provider-specific translation
/// between our internal types and a vendor's wire format.
///
/// `stream`'s returned sequence is finite and not restartable; dropping
/// it mid-stream is how a cancelled turn aborts the upstream connection
/// (spec §4.8, "Cancellation").
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a request and wait for the complete response message.
    async fn complete(&self, req: ChatRequest) -> Result<Message>;

    /// Send a request and return a lazy stream of events.
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// The advertised capabilities of this provider/model combination.
    fn capabilities(&self) -> &LlmCapabilities;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
