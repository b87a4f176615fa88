//! The query–tool loop: the conversation engine driving one REPL turn.
//!
//! One [`QueryLoop::run_turn`] call consumes the conversation by value,
//! streams events to the caller as they happen, and returns the appended-to
//! conversation when the model stops calling tools. The shape of a turn:
//!
//! ```text
//! normalize → provider stream → assistant message
//!     ↓ (tool_use blocks, in order)
//! executor → progress events → tool_result user message
//!     ↓
//! repeat until the model emits no tool_use
//! ```
//!
//! There is no fixed recursion cap; the model's tendency to stop calling
//! tools is the natural terminator. The hard terminators are cancellation
//! and an unrecoverable transport failure (after the provider adapter's
//! own retries), which is the only error this loop propagates.
//!
//! # Cancellation
//!
//! - Observed before the provider call: the turn ends immediately, no
//!   assistant message is produced.
//! - Observed during streaming: the stream is closed, whatever content
//!   finalized is kept as the assistant message, and any tool uses it
//!   contains flow through the executor so each receives a synthetic
//!   `"cancelled"` error result. The tool/result pairing invariant holds
//!   for the next turn.

use crate::executor::{ToolEvent, ToolExecutor};
use crate::provider::{BlockAggregator, LlmHandle};
use crate::tools::ToolContext;
use crate::types::{
    AssistantMessage, Message, ProgressMessage, ToolUseBlock, UserBlock, UserContent, UserMessage,
    normalize_messages,
};
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Source of dynamic system-prompt pieces (reminders) fetched fresh on
/// every LLM call. Owned by external collaborators.
pub type ReminderSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Event streamed to the caller while a turn runs.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// A finalized assistant message (one per LLM call).
    Assistant(AssistantMessage),

    /// The tool-result user message closing one tool batch.
    User(UserMessage),

    /// A transient progress event; never part of the conversation.
    Progress(ProgressMessage),
}

/// The conversation engine for one session.
#[derive(Clone)]
pub struct QueryLoop {
    llm: Arc<LlmHandle>,
    executor: ToolExecutor,
    system_prompts: Vec<String>,
    reminders: Option<ReminderSource>,
}

impl QueryLoop {
    pub fn new(llm: Arc<LlmHandle>, executor: ToolExecutor) -> Self {
        Self {
            llm,
            executor,
            system_prompts: Vec::new(),
            reminders: None,
        }
    }

    /// Appends a static system-prompt piece.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompts.push(prompt.into());
        self
    }

    /// Installs a dynamic reminder source consulted on every call.
    pub fn with_reminders(mut self, reminders: ReminderSource) -> Self {
        self.reminders = Some(reminders);
        self
    }

    /// The provider/model handle this loop runs on.
    pub fn llm(&self) -> &Arc<LlmHandle> {
        &self.llm
    }

    /// Runs one REPL turn to completion.
    ///
    /// Consumes the conversation and returns it with this turn's messages
    /// appended. `ctx` carries the turn's cancel handle and the context
    /// passed into every tool call; `events` receives assistant, user, and
    /// progress events as they materialize (send failures are ignored).
    pub async fn run_turn(
        &self,
        mut conversation: Vec<Message>,
        ctx: &ToolContext,
        events: mpsc::Sender<QueryEvent>,
    ) -> Result<Vec<Message>> {
        loop {
            // Cancellation before the provider call: end the turn with no
            // assistant message.
            if ctx.cancel.is_cancelled() {
                return Ok(conversation);
            }

            conversation = normalize_messages(conversation);

            let mut prompts = self.system_prompts.clone();
            if let Some(reminders) = &self.reminders {
                prompts.extend(reminders());
            }
            let tool_schemas = self.executor.registry().schemas();

            let started = Instant::now();
            let mut stream = self
                .llm
                .provider
                .complete(&conversation, &prompts, &tool_schemas, &ctx.cancel)
                .await?;

            let mut aggregator = BlockAggregator::new();
            let mut finished_blocks = None;
            let mut stream_error: Option<Error> = None;

            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    delta = stream.next() => match delta {
                        None => break,
                        Some(Ok(delta)) => match aggregator.process(delta) {
                            Ok(Some(blocks)) => {
                                finished_blocks = Some(blocks);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                stream_error = Some(e);
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            stream_error = Some(e);
                            break;
                        }
                    },
                }
            }
            drop(stream);

            let cancelled = ctx.cancel.is_cancelled();
            let blocks = match finished_blocks {
                Some(blocks) => blocks,
                // A cancelled or truncated stream keeps whatever finalized.
                None if cancelled => aggregator.finalize_partial(),
                None => match stream_error.take() {
                    Some(e) => return Err(e),
                    None => aggregator.finalize_partial(),
                },
            };

            if cancelled && blocks.is_empty() {
                // Nothing finalized before the interrupt.
                return Ok(conversation);
            }

            let mut assistant = AssistantMessage::new(blocks);
            assistant.duration_ms = started.elapsed().as_millis() as u64;
            assistant.usage = aggregator.usage();

            tracing::debug!(
                id = %assistant.id,
                duration_ms = assistant.duration_ms,
                tool_uses = assistant.tool_uses().len(),
                "assistant turn assembled"
            );

            conversation.push(Message::Assistant(assistant.clone()));
            let _ = events.send(QueryEvent::Assistant(assistant.clone())).await;

            let batch: Vec<ToolUseBlock> =
                assistant.tool_uses().into_iter().cloned().collect();
            if batch.is_empty() {
                // The provider returned no tool uses: natural termination,
                // no user message emitted.
                return Ok(conversation);
            }

            // Forward streaming tool yields as progress events while the
            // batch runs; the forwarder drains until the executor drops its
            // sender.
            let (tool_tx, mut tool_rx) = mpsc::channel::<ToolEvent>(64);
            let progress_events = events.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = tool_rx.recv().await {
                    let content = match event {
                        ToolEvent::Progress { content, .. } => content,
                        ToolEvent::StreamingOutput { line, .. } => line,
                    };
                    let _ = progress_events
                        .send(QueryEvent::Progress(ProgressMessage { content }))
                        .await;
                }
            });

            let results = self.executor.execute_batch(&batch, ctx, tool_tx).await;
            // Executor dropped its sender; wait for the forwarder to drain.
            let _ = forwarder.await;

            let user = UserMessage {
                content: UserContent::Blocks(
                    results.into_iter().map(UserBlock::ToolResult).collect(),
                ),
            };
            conversation.push(Message::User(user.clone()));
            let _ = events.send(QueryEvent::User(user)).await;

            if cancelled {
                // The emitted tool uses received their synthetic results;
                // return control to the REPL.
                return Ok(conversation);
            }
        }
    }
}
