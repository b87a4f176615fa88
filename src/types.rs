//! Core message model for the panpan runtime.
//!
//! The conversation is an ordered sequence of [`Message`]s. Three kinds
//! exist:
//!
//! - [`UserMessage`]: plain text from the user, or an ordered list of
//!   blocks (text and tool results).
//! - [`AssistantMessage`]: the model's output (text, opaque thinking, and
//!   tool-use requests) plus per-call accounting (duration, token usage,
//!   cost) and a stable id.
//! - [`ProgressMessage`]: a transient UI event. Progress messages are never
//!   part of the conversation serialized to the provider; the normalizer
//!   strips them.
//!
//! # Invariants
//!
//! The model enforces, via [`normalize_messages`], the pairing invariant
//! between tool uses and tool results:
//!
//! 1. Every `tool_use` with id `X` in an assistant message is followed,
//!    before the next assistant message, by exactly one `tool_result` with
//!    `tool_use_id = X`.
//! 2. Orphan `tool_result`s (no matching `tool_use` anywhere) are dropped.
//! 3. A `tool_use` that was abandoned (cancellation before dispatch, a
//!    crashed turn) gets a fabricated error result with content
//!    `"<cancelled or lost>"`.
//!
//! Normalization is the only permitted rewrite of prior turns, runs as a
//! single pass just before serialization, and never reorders messages. It
//! is idempotent: `normalize(normalize(c)) == normalize(c)`.
//!
//! # Serialization
//!
//! Messages are tagged by `"role"` and content blocks by `"type"`
//! (`snake_case`), producing the familiar chat-API wire shape:
//!
//! ```json
//! {"role": "assistant", "content": [
//!     {"type": "text", "text": "Let me check."},
//!     {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"path": "/tmp/a"}}
//! ]}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Content of a fabricated `tool_result` for a `tool_use` that never
/// received one (cancelled before dispatch, lost to a crashed turn).
pub const MISSING_TOOL_RESULT_CONTENT: &str = "<cancelled or lost>";

// ============================================================================
// CONTENT BLOCKS
// ============================================================================

/// Simple text content in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// The text content.
    pub text: String,
}

impl TextBlock {
    /// Creates a new text block from any string-like type.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Opaque model reasoning, preserved verbatim across turns for providers
/// that require signed reasoning replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// The reasoning text. Treated as opaque; never edited or summarized.
    pub thinking: String,

    /// Provider signature over the reasoning, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ThinkingBlock {
    pub fn new(thinking: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            signature: None,
        }
    }

    pub fn with_signature(thinking: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            signature: Some(signature.into()),
        }
    }
}

/// Tool use request emitted by the model.
///
/// The `id` correlates the eventual [`ToolResultBlock`] back to this
/// request; ids are unique within one assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Unique identifier for this tool call.
    pub id: String,

    /// Name of the tool to execute. Resolved against the tool registry by
    /// string name at dispatch time.
    pub name: String,

    /// JSON input for the tool. Opaque to the message model; validated
    /// against the tool's schema by the executor.
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Result of one tool execution, sent back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// Id of the `tool_use` this result answers.
    pub tool_use_id: String,

    /// Textual result content as the model should see it.
    pub content: String,

    /// Whether the tool failed (validation error, runtime error,
    /// permission denial, cancellation). Failures are surfaced to the
    /// model only through this flag; they never abort the loop.
    pub is_error: bool,

    /// Wall-clock duration of the tool call, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolResultBlock {
    /// Creates a successful tool result.
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
            duration_ms: None,
        }
    }

    /// Creates an error tool result.
    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
            duration_ms: None,
        }
    }

    /// Attaches a measured duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Blocks that can appear in a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    Text(TextBlock),
    ToolResult(ToolResultBlock),
}

/// Blocks that can appear in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text(TextBlock),
    Thinking(ThinkingBlock),
    ToolUse(ToolUseBlock),
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Content of a user message: a plain string or an ordered block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

/// A user turn: the prompt itself, or the tool results answering the
/// previous assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
}

impl UserMessage {
    /// Iterates the tool-result blocks, if any.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultBlock> {
        let blocks = match &self.content {
            UserContent::Text(_) => &[][..],
            UserContent::Blocks(blocks) => blocks.as_slice(),
        };
        blocks.iter().filter_map(|b| match b {
            UserBlock::ToolResult(r) => Some(r),
            UserBlock::Text(_) => None,
        })
    }
}

/// Token usage counters for a single LLM call.
///
/// These describe one assistant message, not cumulative session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// One assistant turn: the assembled output of a single LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Stable message id.
    pub id: String,

    /// Ordered content blocks as streamed by the provider.
    pub content: Vec<AssistantBlock>,

    /// Wall-clock duration from just before send to stream close.
    #[serde(default)]
    pub duration_ms: u64,

    /// Token usage reported by the provider for this call.
    #[serde(default)]
    pub usage: Usage,

    /// Cost of this call in USD, as computed by the host's accounting.
    #[serde(default)]
    pub cost_usd: f64,
}

impl AssistantMessage {
    /// Creates an assistant message with a fresh id and zeroed accounting.
    pub fn new(content: Vec<AssistantBlock>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            content,
            duration_ms: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
        }
    }

    /// The `tool_use` blocks of this message, in appearance order.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::ToolUse(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text blocks, separated by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A transient progress event (tool output line, status update). Shown to
/// the user, never sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub content: String,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    Progress(ProgressMessage),
}

impl Message {
    /// Creates a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: UserContent::Text(text.into()),
        })
    }

    /// Creates a user message from an ordered block list.
    pub fn user_with_blocks(blocks: Vec<UserBlock>) -> Self {
        Message::User(UserMessage {
            content: UserContent::Blocks(blocks),
        })
    }

    /// Creates an assistant message with a fresh id.
    pub fn assistant(content: Vec<AssistantBlock>) -> Self {
        Message::Assistant(AssistantMessage::new(content))
    }

    /// Creates a progress message.
    pub fn progress(content: impl Into<String>) -> Self {
        Message::Progress(ProgressMessage {
            content: content.into(),
        })
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Normalizes a conversation just before serialization to the provider.
///
/// Single pass over the list; never reorders surviving messages:
///
/// 1. Strips [`ProgressMessage`]s.
/// 2. Drops orphan `tool_result` blocks, those whose `tool_use_id`
///    matches no `tool_use` in any assistant message. A user block
///    message that becomes empty is dropped entirely.
/// 3. For each `tool_use` with no result before the next assistant
///    message, inserts an error result with content
///    [`MISSING_TOOL_RESULT_CONTENT`] in a user message placed
///    immediately after the owning assistant message.
///
/// Idempotent by construction: a normalized conversation has no progress
/// messages, no orphans, and a result for every use, so a second pass
/// rewrites nothing.
pub fn normalize_messages(messages: Vec<Message>) -> Vec<Message> {
    // All tool_use ids that exist anywhere in the conversation. A
    // tool_result answering none of these is an orphan.
    let known_ids: HashSet<String> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Assistant(a) => Some(a),
            _ => None,
        })
        .flat_map(|a| a.tool_uses().into_iter().map(|t| t.id.clone()))
        .collect();

    // Pass 1: strip progress messages and orphan results.
    let mut cleaned: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::Progress(_) => {}
            Message::User(user) => match user.content {
                UserContent::Text(text) => cleaned.push(Message::user(text)),
                UserContent::Blocks(blocks) => {
                    let kept: Vec<UserBlock> = blocks
                        .into_iter()
                        .filter(|block| match block {
                            UserBlock::ToolResult(r) => known_ids.contains(&r.tool_use_id),
                            UserBlock::Text(_) => true,
                        })
                        .collect();
                    if !kept.is_empty() {
                        cleaned.push(Message::user_with_blocks(kept));
                    }
                }
            },
            other => cleaned.push(other),
        }
    }

    // Pass 2: fabricate error results for abandoned tool uses. The
    // fabricated user message lands directly after the assistant message
    // that owns the uses, ahead of any later results for the same turn.
    let mut out: Vec<Message> = Vec::with_capacity(cleaned.len());
    for (index, message) in cleaned.iter().enumerate() {
        out.push(message.clone());

        let Message::Assistant(assistant) = message else {
            continue;
        };
        let uses = assistant.tool_uses();
        if uses.is_empty() {
            continue;
        }

        // Results visible between this assistant message and the next one.
        let mut answered: HashSet<&str> = HashSet::new();
        for later in &cleaned[index + 1..] {
            match later {
                Message::Assistant(_) => break,
                Message::User(user) => {
                    answered.extend(user.tool_results().map(|r| r.tool_use_id.as_str()));
                }
                Message::Progress(_) => {}
            }
        }

        let fabricated: Vec<UserBlock> = uses
            .iter()
            .filter(|t| !answered.contains(t.id.as_str()))
            .map(|t| {
                UserBlock::ToolResult(ToolResultBlock::error(&t.id, MISSING_TOOL_RESULT_CONTENT))
            })
            .collect();
        if !fabricated.is_empty() {
            out.push(Message::user_with_blocks(fabricated));
        }
    }

    out
}
