//! Token counter (spec §4.2).
//!
//! Approximates provider tokenization well enough to drive budget
//! decisions without shipping a real BPE tokenizer per provider. The
//! estimate must never *underestimate* — a budget computed from a count
//! that's too low can let a request exceed the provider's context
//! window; overestimating only makes compaction trigger a little early.

use crate::tool::Message;

/// Conservative characters-per-token ratio. Real BPE tokenizers average
/// closer to 4 chars/token for English prose; we intentionally bias low
/// so the estimate rounds up rather than down.
const CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed overhead for message framing (role tag, separators) that a
/// provider's chat template adds around every message regardless of
/// content length.
const PER_MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Additional overhead per tool call (id, name, JSON punctuation) beyond
/// what's captured by counting the serialized arguments text.
const PER_TOOL_CALL_OVERHEAD_TOKENS: usize = 10;

/// Estimate the token count of a single string.
pub fn count(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as f64) / CHARS_PER_TOKEN).ceil() as usize
}

/// Estimate the token count of a full message list, including per-message
/// and per-tool-call framing overhead.
pub fn count_messages(messages: &[Message]) -> usize {
    messages.iter().map(count_message).sum()
}

pub fn count_message(message: &Message) -> usize {
    let mut total = PER_MESSAGE_OVERHEAD_TOKENS + count(&message.content);
    for call in &message.tool_calls {
        total += PER_TOOL_CALL_OVERHEAD_TOKENS;
        total += count(&call.name);
        total += count(&call.arguments.to_string());
    }
    if !message.tool_call_id.is_empty() {
        total += count(&message.tool_call_id);
    }
    total
}

/// Estimate the token cost of a tool-definitions snapshot as it would be
/// serialized into the provider request body.
pub fn count_tool_definitions(defs: &[serde_json::Value]) -> usize {
    defs.iter().map(|d| count(&d.to_string())).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Role, ToolCall};

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count(""), 0);
    }

    #[test]
    fn short_text_rounds_up_at_least_one_token() {
        assert!(count("hi") >= 1);
    }

    #[test]
    fn longer_text_scales_with_length() {
        let short = count("hello");
        let long = count(&"hello ".repeat(50));
        assert!(long > short);
    }

    #[test]
    fn message_overhead_applies_even_for_empty_content() {
        let m = Message {
            role: Role::User,
            content: String::new(),
            tool_calls: vec![],
            tool_call_id: String::new(),
        };
        assert_eq!(count_message(&m), PER_MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn tool_call_adds_overhead_beyond_its_own_text() {
        let base = Message::assistant("", vec![]);
        let with_call = Message::assistant(
            "",
            vec![ToolCall {
                id: "c1".into(),
                name: "exec".into(),
                arguments: serde_json::json!({"cmd": "ls"}),
            }],
        );
        assert!(count_message(&with_call) > count_message(&base));
    }

    #[test]
    fn count_messages_sums_each_message() {
        let msgs = vec![Message::user("hello"), Message::assistant("world", vec![])];
        let total: usize = msgs.iter().map(count_message).sum();
        assert_eq!(count_messages(&msgs), total);
    }
}
