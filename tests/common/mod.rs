//! Shared test support: a scripted provider that replays canned delta
//! sequences, one per LLM call.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use panpan::provider::{CompletionDelta, CompletionStream, Provider};
use panpan::tools::ToolSchema;
use panpan::types::Message;
use panpan::{CancelHandle, LlmHandle, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted LLM call.
pub struct Script {
    pub deltas: Vec<CompletionDelta>,
    /// When set, the stream never ends after the deltas; only
    /// cancellation closes it. Used for interrupt scenarios.
    pub hang: bool,
}

impl Script {
    pub fn finishing(deltas: Vec<CompletionDelta>) -> Self {
        Self {
            deltas,
            hang: false,
        }
    }

    pub fn hanging(deltas: Vec<CompletionDelta>) -> Self {
        Self { deltas, hang: true }
    }
}

/// Provider replaying scripts in order; each `complete` call consumes one.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    pub calls: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _system_prompts: &[String],
        _tools: &[ToolSchema],
        _cancel: &CancelHandle,
    ) -> Result<CompletionStream> {
        *self.calls.lock().unwrap() += 1;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::finishing(vec![CompletionDelta::Finish("stop".into())]));

        let head = futures::stream::iter(script.deltas.into_iter().map(Ok));
        if script.hang {
            Ok(Box::pin(head.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }
}

/// A text-only turn ending with `finish_reason: "stop"`.
pub fn text_turn(text: &str) -> Script {
    Script::finishing(vec![
        CompletionDelta::Text(text.to_string()),
        CompletionDelta::Finish("stop".to_string()),
    ])
}

/// A turn emitting the given `(id, name, arguments_json)` tool calls.
pub fn tool_call_turn(calls: &[(&str, &str, &str)]) -> Script {
    let mut deltas: Vec<CompletionDelta> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, arguments))| CompletionDelta::ToolCall {
            index: index as u32,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: Some(arguments.to_string()),
        })
        .collect();
    deltas.push(CompletionDelta::Finish("tool_calls".to_string()));
    Script::finishing(deltas)
}

/// Wraps scripts into an inheritable LLM handle.
pub fn scripted_llm(scripts: Vec<Script>) -> Arc<LlmHandle> {
    Arc::new(LlmHandle::new(
        "test-model",
        Arc::new(ScriptedProvider::new(scripts)),
    ))
}
