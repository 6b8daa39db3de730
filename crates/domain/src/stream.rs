use crate::tool::Message;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted by a provider streaming client while it drives a
/// single completion. This is the public surface a session turn engine
/// subscriber observes; internal per-index tool-call argument
/// accumulation happens inside the provider adapter and is never
/// exposed as a separate event — only the fully assembled tool calls on
/// `StreamComplete`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A chunk of ordinary assistant content.
    #[serde(rename = "content_delta")]
    ContentDelta { text: String },

    /// A chunk of provider "reasoning"/thinking content, when the model
    /// exposes it. Never mixed into `content_delta`.
    #[serde(rename = "reasoning_delta")]
    ReasoningDelta { text: String },

    /// A tool call has been identified (id and name known); its
    /// arguments may still be arriving incrementally behind the scenes.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// The stream is finished; carries the fully assembled assistant
    /// message (content plus any tool calls with complete arguments).
    #[serde(rename = "stream_complete")]
    StreamComplete { message: Message, usage: Option<Usage> },

    /// A provider-level error terminated the stream before completion.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token usage for a completion, when the provider reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
