//! LLM provider interface and the bundled OpenAI-compatible adapter.
//!
//! The query loop depends only on the [`Provider`] trait: `complete` takes
//! the normalized conversation, system prompt pieces, and tool schemas, and
//! returns a stream of incremental [`CompletionDelta`]s. The loop assembles
//! deltas into one assistant message with a [`BlockAggregator`].
//!
//! # Delta aggregation
//!
//! Tool calls arrive as interleaved fragments across chunks, not complete
//! objects:
//!
//! ```text
//! Chunk 1: tool_calls[0] = { id: "call_1", name: "Read" }
//! Chunk 2: tool_calls[0] = { arguments: "{\"pa" }
//! Chunk 3: tool_calls[0] = { arguments: "th\":\"/tmp/a\"}" }
//! Chunk 4: finish_reason: "tool_calls"
//! ```
//!
//! The aggregator keys partial tool calls by their stream index, accumulates
//! argument text verbatim, and parses the JSON only at finish. On
//! cancellation mid-stream, [`BlockAggregator::finalize_partial`] recovers
//! whatever finalized enough to keep: buffered text, and tool calls whose id
//! and name arrived and whose accumulated arguments parse.
//!
//! # Plugging providers
//!
//! Providers are selected by model-name prefix through a
//! [`ProviderRegistry`]; the longest matching prefix wins and unmatched
//! models fall back to the OpenAI-compatible adapter. Additional adapters
//! register a factory and are otherwise external to this crate.

use crate::cancel::CancelHandle;
use crate::config::ProviderConfig;
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::tools::ToolSchema;
use crate::types::{
    AssistantBlock, Message, TextBlock, ThinkingBlock, ToolUseBlock, Usage, UserContent, UserBlock,
};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// One incremental event from a provider stream.
#[derive(Debug, Clone)]
pub enum CompletionDelta {
    /// A fragment of assistant text.
    Text(String),

    /// A fragment of opaque model reasoning.
    Thinking {
        thinking: String,
        signature: Option<String>,
    },

    /// A fragment of a tool call, keyed by stream index.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },

    /// Token usage for the whole call. Usually arrives once, near the end.
    Usage(Usage),

    /// Generation finished with the given reason ("stop", "tool_calls", ...).
    Finish(String),
}

/// Stream of completion deltas.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionDelta>> + Send>>;

/// An LLM provider the query loop can stream from.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Starts one completion. Transport retries happen inside the adapter;
    /// a returned error is final for this turn.
    async fn complete(
        &self,
        messages: &[Message],
        system_prompts: &[String],
        tools: &[ToolSchema],
        cancel: &CancelHandle,
    ) -> Result<CompletionStream>;
}

/// The provider/model pair a conversation runs on. Threaded through
/// `ToolContext` so the Task tool can inherit or override it for nested
/// conversations.
#[derive(Clone)]
pub struct LlmHandle {
    pub model: String,
    pub provider: Arc<dyn Provider>,
}

impl LlmHandle {
    pub fn new(model: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        Self {
            model: model.into(),
            provider,
        }
    }
}

impl std::fmt::Debug for LlmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmHandle").field("model", &self.model).finish()
    }
}

// ============================================================================
// BLOCK AGGREGATION
// ============================================================================

/// In-progress tool call assembled from stream fragments.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    /// Raw argument text; may be split at arbitrary byte positions across
    /// chunks, so it is only parsed as JSON once the call is complete.
    arguments: String,
}

impl PartialToolCall {
    /// Converts to a block if the call is complete enough: id and name
    /// present, arguments empty or valid JSON.
    fn into_block(self) -> Result<Option<ToolUseBlock>> {
        let (Some(id), Some(name)) = (self.id, self.name) else {
            return Ok(None);
        };
        let input = if self.arguments.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments)
                .map_err(|e| Error::stream(format!("Failed to parse tool arguments: {}", e)))?
        };
        Ok(Some(ToolUseBlock::new(id, name, input)))
    }

    /// Like [`into_block`](Self::into_block) but drops calls whose
    /// arguments never finished arriving instead of erroring. Used when a
    /// cancelled stream is finalized.
    fn into_block_lossy(self) -> Option<ToolUseBlock> {
        let (Some(id), Some(name)) = (&self.id, &self.name) else {
            return None;
        };
        let input: serde_json::Value = if self.arguments.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments).ok()?
        };
        Some(ToolUseBlock::new(id.clone(), name.clone(), input))
    }
}

/// Stateful accumulator turning a delta stream into assistant blocks.
///
/// Feed every delta to [`process`](Self::process); it returns the complete
/// block list when a `Finish` delta arrives. Block order on flush is
/// thinking, text, then tool calls by stream index.
#[derive(Debug, Default)]
pub struct BlockAggregator {
    text_buffer: String,
    thinking_buffer: String,
    thinking_signature: Option<String>,
    // BTreeMap so flushed tool calls keep their stream-index order.
    tool_calls: BTreeMap<u32, PartialToolCall>,
    usage: Usage,
    finish_reason: Option<String>,
}

impl BlockAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token usage accumulated so far.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// The finish reason, once one arrived.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Processes one delta. Returns `Some(blocks)` when the stream
    /// finished; `None` while generation is ongoing.
    pub fn process(&mut self, delta: CompletionDelta) -> Result<Option<Vec<AssistantBlock>>> {
        match delta {
            CompletionDelta::Text(text) => {
                self.text_buffer.push_str(&text);
                Ok(None)
            }
            CompletionDelta::Thinking {
                thinking,
                signature,
            } => {
                self.thinking_buffer.push_str(&thinking);
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
                Ok(None)
            }
            CompletionDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = id {
                    entry.id = Some(id);
                }
                if let Some(name) = name {
                    entry.name = Some(name);
                }
                if let Some(arguments) = arguments {
                    entry.arguments.push_str(&arguments);
                }
                Ok(None)
            }
            CompletionDelta::Usage(usage) => {
                self.usage = usage;
                Ok(None)
            }
            CompletionDelta::Finish(reason) => {
                self.finish_reason = Some(reason);
                let mut blocks = self.flush_common();
                for (_, partial) in std::mem::take(&mut self.tool_calls) {
                    if let Some(block) = partial.into_block()? {
                        blocks.push(AssistantBlock::ToolUse(block));
                    }
                }
                Ok(Some(blocks))
            }
        }
    }

    /// Flushes whatever finalized enough to keep. Called when the stream
    /// was cancelled or closed without a finish delta.
    pub fn finalize_partial(&mut self) -> Vec<AssistantBlock> {
        let mut blocks = self.flush_common();
        for (_, partial) in std::mem::take(&mut self.tool_calls) {
            if let Some(block) = partial.into_block_lossy() {
                blocks.push(AssistantBlock::ToolUse(block));
            }
        }
        blocks
    }

    fn flush_common(&mut self) -> Vec<AssistantBlock> {
        let mut blocks = Vec::new();
        if !self.thinking_buffer.is_empty() {
            blocks.push(AssistantBlock::Thinking(ThinkingBlock {
                thinking: std::mem::take(&mut self.thinking_buffer),
                signature: self.thinking_signature.take(),
            }));
        }
        if !self.text_buffer.is_empty() {
            blocks.push(AssistantBlock::Text(TextBlock::new(std::mem::take(
                &mut self.text_buffer,
            ))));
        }
        blocks
    }
}

// ============================================================================
// OPENAI-COMPATIBLE WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn plain(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: WireToolCallFunction,
}

#[derive(Debug, Clone, Serialize)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

/// Converts the internal conversation into the OpenAI chat wire shape.
///
/// Assistant `tool_use` blocks become `tool_calls` entries; user
/// `tool_result` blocks become `role:"tool"` messages carrying the
/// `tool_call_id`. Thinking blocks do not exist on this wire and are
/// skipped; providers that replay reasoning plug in their own adapter.
fn to_wire_messages(messages: &[Message], system_prompts: &[String]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + system_prompts.len());

    for prompt in system_prompts {
        if !prompt.is_empty() {
            wire.push(WireMessage::plain("system", prompt.clone()));
        }
    }

    for message in messages {
        match message {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => wire.push(WireMessage::plain("user", text.clone())),
                UserContent::Blocks(blocks) => {
                    let mut text_parts: Vec<&str> = Vec::new();
                    for block in blocks {
                        match block {
                            UserBlock::Text(t) => text_parts.push(&t.text),
                            UserBlock::ToolResult(result) => wire.push(WireMessage {
                                role: "tool",
                                content: Some(result.content.clone()),
                                tool_calls: None,
                                tool_call_id: Some(result.tool_use_id.clone()),
                            }),
                        }
                    }
                    if !text_parts.is_empty() {
                        wire.push(WireMessage::plain("user", text_parts.join("\n")));
                    }
                }
            },
            Message::Assistant(assistant) => {
                let text = assistant.text();
                let tool_calls: Vec<WireToolCall> = assistant
                    .tool_uses()
                    .into_iter()
                    .map(|t| WireToolCall {
                        id: t.id.clone(),
                        call_type: "function",
                        function: WireToolCallFunction {
                            name: t.name.clone(),
                            arguments: t.input.to_string(),
                        },
                    })
                    .collect();
                wire.push(WireMessage {
                    role: "assistant",
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            // Normalization strips these before serialization.
            Message::Progress(_) => {}
        }
    }

    wire
}

fn chunk_to_deltas(chunk: WireChunk) -> Vec<CompletionDelta> {
    let mut deltas = Vec::new();

    if let Some(usage) = chunk.usage {
        deltas.push(CompletionDelta::Usage(Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cache_read_tokens: usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            cache_creation_tokens: 0,
        }));
    }

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                deltas.push(CompletionDelta::Text(content));
            }
        }
        if let Some(tool_calls) = choice.delta.tool_calls {
            for call in tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                deltas.push(CompletionDelta::ToolCall {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            deltas.push(CompletionDelta::Finish(reason));
        }
    }

    deltas
}

// ============================================================================
// OPENAI-COMPATIBLE PROVIDER
// ============================================================================

/// Streaming adapter for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiProvider {
    model: String,
    base_url: String,
    api_key: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    retry: RetryConfig,
    http: reqwest::Client,
}

impl OpenAiProvider {
    /// Builds the adapter from resolved configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            retry: RetryConfig::default(),
            http,
        })
    }

    /// Overrides the transport retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send_request(&self, request: &WireRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::api(format!("API error {}: {}", status, body)));
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[Message],
        system_prompts: &[String],
        tools: &[ToolSchema],
        cancel: &CancelHandle,
    ) -> Result<CompletionStream> {
        let wire_tools = if tools.is_empty() {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| WireTool {
                        tool_type: "function",
                        function: WireFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let request = WireRequest {
            model: self.model.clone(),
            messages: to_wire_messages(messages, system_prompts),
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: wire_tools,
            stream_options: Some(WireStreamOptions {
                include_usage: true,
            }),
        };

        // Retry covers connection and non-2xx failures up front; once the
        // stream is open, mid-stream errors are final for the turn.
        let response =
            retry_with_backoff_conditional(self.retry.clone(), || self.send_request(&request))
                .await?;

        let sse = response.bytes_stream().eventsource();
        let deltas = sse
            .map(|event| match event {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        Ok(Vec::new())
                    } else {
                        serde_json::from_str::<WireChunk>(&event.data)
                            .map(chunk_to_deltas)
                            .map_err(|e| Error::stream(format!("Failed to parse chunk: {}", e)))
                    }
                }
                Err(e) => Err(Error::stream(format!("SSE error: {}", e))),
            })
            .flat_map(|result| {
                futures::stream::iter(match result {
                    Ok(deltas) => deltas.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            });

        // Close the stream promptly when the turn is cancelled; the query
        // loop then salvages whatever finalized.
        let cancel = cancel.clone();
        let bounded = deltas.take_until(async move { cancel.cancelled().await });

        Ok(Box::pin(bounded))
    }
}

// ============================================================================
// PROVIDER REGISTRY
// ============================================================================

/// Factory producing a provider for a resolved configuration.
pub type ProviderFactory = Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Registry plugging providers in by model-name prefix.
///
/// `resolve` picks the registered factory with the longest prefix matching
/// the model name; unmatched models use the default OpenAI-compatible
/// adapter.
#[derive(Clone)]
pub struct ProviderRegistry {
    entries: Vec<(String, ProviderFactory)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a factory for model names starting with `prefix`.
    pub fn register(&mut self, prefix: impl Into<String>, factory: ProviderFactory) {
        self.entries.push((prefix.into(), factory));
    }

    /// Resolves a provider for `config.model`.
    pub fn resolve(&self, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        let matched = self
            .entries
            .iter()
            .filter(|(prefix, _)| config.model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match matched {
            Some((_, factory)) => factory(config),
            None => Ok(Arc::new(OpenAiProvider::new(config)?)),
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
