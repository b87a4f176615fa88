//! Subagent runtime: isolated nested query loops behind the Task tool.
//!
//! A subagent is a fresh conversation run under a filtered tool set and
//! its own system prompt. The outer model launches one by calling the
//! `Task` tool with `{subagent_type, prompt}`; the nested loop runs to
//! completion and the subagent's final assistant text comes back as the
//! tool result. Nested progress surfaces as `Progress` yields so the REPL
//! can show activity while the subagent works.
//!
//! Tool filtering is a set restriction: the agent's allowed tools, minus
//! [`SUBAGENT_DISALLOWED_TOOLS`], minus the config's own
//! `disallowed_tools`. The default disallowed set strips `Task` itself, so
//! a subagent cannot spawn further subagents; a config opts back in with
//! `allow_nested_agents`, which is off by default.

use crate::executor::{ExecutorOptions, ToolExecutor};
use crate::provider::LlmHandle;
use crate::query::{QueryEvent, QueryLoop};
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolYield, tool};
use crate::types::Message;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Tools stripped from every subagent unless a config gates them back in.
pub const SUBAGENT_DISALLOWED_TOOLS: [&str; 4] =
    ["Task", "TaskOutput", "EnterPlanMode", "ExitPlanMode"];

/// Which tools an agent may see, before the disallowed sets apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ToolAccessRepr", into = "ToolAccessRepr")]
pub enum ToolAccess {
    /// Every registered tool (`"*"` in config files).
    All,
    /// An explicit allow-list.
    Named(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ToolAccessRepr {
    Str(String),
    List(Vec<String>),
}

impl From<ToolAccessRepr> for ToolAccess {
    fn from(repr: ToolAccessRepr) -> Self {
        match repr {
            ToolAccessRepr::Str(s) if s == "*" => ToolAccess::All,
            ToolAccessRepr::Str(s) => ToolAccess::Named(vec![s]),
            ToolAccessRepr::List(names) => ToolAccess::Named(names),
        }
    }
}

impl From<ToolAccess> for ToolAccessRepr {
    fn from(access: ToolAccess) -> Self {
        match access {
            ToolAccess::All => ToolAccessRepr::Str("*".to_string()),
            ToolAccess::Named(names) => ToolAccessRepr::List(names),
        }
    }
}

/// One subagent type's configuration, read at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The type name the model passes as `subagent_type`.
    pub name: String,

    /// Guidance shown to the outer model on when to delegate here.
    #[serde(default)]
    pub when_to_use: String,

    /// Tool access before disallowed sets apply.
    pub tools: ToolAccess,

    /// Additional tools this agent may never use.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,

    /// Model override; `None` or `"inherit"` inherits the parent's.
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt seeding the nested conversation.
    pub system_prompt: String,

    /// Gates `Task`/`TaskOutput` back in so this agent can spawn
    /// subagents of its own. Off by default.
    #[serde(default)]
    pub allow_nested_agents: bool,
}

impl AgentConfig {
    /// Whether this config inherits the parent's model.
    pub fn inherits_model(&self) -> bool {
        matches!(self.model.as_deref(), None | Some("inherit"))
    }
}

/// Registry of agent configurations, keyed by type name.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentConfig>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = AgentConfig>) -> Self {
        Self {
            agents: configs
                .into_iter()
                .map(|c| (c.name.clone(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentConfig>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Restricts the full registry to what one agent may use.
///
/// Set-theoretically: `result ⊆ allowed(cfg)` and
/// `result ∩ (SUBAGENT_DISALLOWED_TOOLS ∪ cfg.disallowed_tools) = ∅`,
/// modulo the nested-agent gate.
pub fn filter_tools_for_agent(all: &ToolRegistry, config: &AgentConfig) -> ToolRegistry {
    let base = match &config.tools {
        ToolAccess::All => all.clone(),
        ToolAccess::Named(names) => all.retain_named(names),
    };

    let mut blocked: Vec<&str> = SUBAGENT_DISALLOWED_TOOLS
        .iter()
        .copied()
        .filter(|name| {
            !(config.allow_nested_agents && matches!(*name, "Task" | "TaskOutput"))
        })
        .collect();
    blocked.extend(config.disallowed_tools.iter().map(String::as_str));

    base.without_named(&blocked)
}

/// Resolver producing an [`LlmHandle`] for an agent's model override.
pub type LlmResolver = Arc<dyn Fn(&str) -> Result<Arc<LlmHandle>> + Send + Sync>;

/// Wiring for the Task tool.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Resolves model overrides named by agent configs. Without one,
    /// every subagent inherits the parent's handle.
    pub resolver: Option<LlmResolver>,

    /// Executor options for nested batches (permission callback,
    /// concurrency cap).
    pub executor_options: ExecutorOptions,
}

/// Builds the Task tool over an agent registry and the full tool set.
///
/// The tool is a barrier (not read-only, not concurrency-safe): a subagent
/// may run write tools, so its effects order with the rest of the batch.
pub fn task_tool(
    agents: Arc<AgentRegistry>,
    all_tools: ToolRegistry,
    options: TaskOptions,
) -> Tool {
    tool(
        "Task",
        "Delegate a task to a subagent with an isolated conversation and a filtered tool set",
    )
    .param("subagent_type", "string")
    .param("prompt", "string")
    .build(move |input, ctx| {
        let agents = agents.clone();
        let all_tools = all_tools.clone();
        let options = options.clone();
        let (tx, rx) = mpsc::channel::<Result<ToolYield>>(64);

        tokio::spawn(async move {
            let outcome = run_subagent(agents, all_tools, options, input, ctx, &tx).await;
            let terminal = match outcome {
                Ok((data, result_for_assistant)) => Ok(ToolYield::Result {
                    data,
                    result_for_assistant,
                }),
                Err(e) => Err(e),
            };
            let _ = tx.send(terminal).await;
        });

        Box::pin(ReceiverStream::new(rx))
    })
}

/// Runs one subagent conversation to completion.
///
/// Returns `(data, result_for_assistant)` for the terminal yield; any
/// failure (unknown type, missing LLM handle, transport error,
/// cancellation) bubbles to the outer executor, which renders it as an
/// error `tool_result`.
async fn run_subagent(
    agents: Arc<AgentRegistry>,
    all_tools: ToolRegistry,
    options: TaskOptions,
    input: serde_json::Value,
    ctx: ToolContext,
    progress: &mpsc::Sender<Result<ToolYield>>,
) -> Result<(serde_json::Value, String)> {
    let subagent_type = input["subagent_type"]
        .as_str()
        .ok_or_else(|| Error::invalid_input("subagent_type is required"))?;
    let prompt = input["prompt"]
        .as_str()
        .ok_or_else(|| Error::invalid_input("prompt is required"))?;

    let config = agents
        .get(subagent_type)
        .ok_or_else(|| Error::tool(format!("Unknown subagent type '{}'", subagent_type)))?;

    let llm = if config.inherits_model() {
        ctx.llm
            .clone()
            .ok_or_else(|| Error::config("no LLM handle available for subagent"))?
    } else {
        let model = config.model.as_deref().unwrap_or_default();
        match &options.resolver {
            Some(resolve) => resolve(model)?,
            None => ctx
                .llm
                .clone()
                .ok_or_else(|| Error::config("no LLM handle available for subagent"))?,
        }
    };

    let filtered = filter_tools_for_agent(&all_tools, &config);
    tracing::debug!(
        agent = %config.name,
        tools = ?filtered.names(),
        "starting subagent"
    );

    let executor = ToolExecutor::with_options(filtered, options.executor_options.clone());
    let nested = QueryLoop::new(llm.clone(), executor)
        .with_system_prompt(config.system_prompt.clone());

    // Fresh conversation and context: same cwd and cancel handle as the
    // parent turn, its own read-timestamp map, the resolved LLM handle.
    let nested_ctx = ToolContext::new(ctx.cwd.clone())
        .with_cancel(ctx.cancel.clone())
        .with_llm(llm);
    let conversation = vec![Message::user(prompt)];

    let (event_tx, mut event_rx) = mpsc::channel::<QueryEvent>(64);
    let progress_out = progress.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let content = match event {
                QueryEvent::Progress(p) => p.content,
                QueryEvent::Assistant(a) => {
                    let text = a.text();
                    if text.is_empty() {
                        continue;
                    }
                    text
                }
                QueryEvent::User(_) => continue,
            };
            let _ = progress_out
                .send(Ok(ToolYield::Progress { content }))
                .await;
        }
    });

    let final_conversation = nested.run_turn(conversation, &nested_ctx, event_tx).await;
    let _ = forwarder.await;
    let final_conversation = final_conversation?;

    if nested_ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let result_text = final_conversation
        .iter()
        .rev()
        .find_map(|m| match m {
            Message::Assistant(a) => Some(a.text()),
            _ => None,
        })
        .unwrap_or_default();

    let turns = final_conversation
        .iter()
        .filter(|m| matches!(m, Message::Assistant(_)))
        .count();

    Ok((
        json!({ "subagent": config.name, "turns": turns }),
        result_text,
    ))
}
