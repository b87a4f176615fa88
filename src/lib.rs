//! # panpan core
//!
//! The core runtime of a tool-using terminal LLM assistant. The REPL
//! front-end, concrete tools, and provider fleet live outside this crate;
//! what lives here is the machinery that makes a turn happen:
//!
//! - **Query loop** ([`query`]): normalize the conversation, stream one
//!   assistant message from the provider, dispatch its tool calls, feed
//!   the results back, repeat until the model stops calling tools.
//! - **Tool executor** ([`executor`]): ordered, bounded-concurrent
//!   dispatch. Consecutive read-only, concurrency-safe tools run in
//!   parallel (up to 10 in flight); anything else is a barrier. Results
//!   always come back in batch order.
//! - **Subagent runtime** ([`agent`]): the Task tool runs an isolated
//!   nested conversation under a filtered tool set and returns its final
//!   text to the outer loop.
//! - **Remote execution** ([`remote`]): an authenticated HTTP daemon
//!   bootstrapped over SSH, plus a process-wide connection pool with
//!   on-demand liveness and explicit reconnect.
//!
//! ## A minimal session
//!
//! ```rust,no_run
//! use panpan::{
//!     CancelHandle, Message, ProviderConfig, QueryLoop, ToolContext, ToolExecutor,
//!     ToolRegistry, LlmHandle, ProviderRegistry,
//! };
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> panpan::Result<()> {
//! let config = ProviderConfig::resolve(Some("qwen2.5-32b-instruct"), None, None)?;
//! let provider = ProviderRegistry::new().resolve(&config)?;
//! let llm = Arc::new(LlmHandle::new(config.model.clone(), provider));
//!
//! let tools = ToolRegistry::new(); // host registers its tools here
//! let query = QueryLoop::new(llm.clone(), ToolExecutor::new(tools))
//!     .with_system_prompt("You are a helpful assistant");
//!
//! let cancel = CancelHandle::new();
//! let ctx = ToolContext::new(std::env::current_dir()?)
//!     .with_cancel(cancel.clone())
//!     .with_llm(llm);
//!
//! let (events, mut rx) = mpsc::channel(64);
//! tokio::spawn(async move { while rx.recv().await.is_some() {} });
//!
//! let conversation = query
//!     .run_turn(vec![Message::user("read /tmp/a.txt")], &ctx, events)
//!     .await?;
//! # let _ = conversation;
//! # Ok(())
//! # }
//! ```

/// Subagent registry, tool filtering, and the Task tool.
pub mod agent;

/// Shared cancellation handle threaded through the turn.
mod cancel;

/// Environment/flag resolution for the provider connection.
pub mod config;

/// Error enum and `Result` alias used across the crate.
mod error;

/// Ordered, bounded-concurrent tool dispatch.
pub mod executor;

/// LLM provider trait, delta aggregation, OpenAI-compatible adapter.
pub mod provider;

/// The query–tool loop driving one REPL turn.
pub mod query;

/// Remote execution: daemon, wire protocol, SSH bootstrap, pool.
pub mod remote;

/// Retry with exponential backoff, used by the provider transport.
pub mod retry;

/// Tool contract: descriptors, schemas, yields, registry.
pub mod tools;

/// Message model and pre-send normalization.
pub mod types;

// --- Core re-exports ---

pub use agent::{
    AgentConfig, AgentRegistry, SUBAGENT_DISALLOWED_TOOLS, TaskOptions, ToolAccess,
    filter_tools_for_agent, task_tool,
};
pub use cancel::CancelHandle;
pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use executor::{
    ExecutorOptions, MAX_CONCURRENT_TOOLS, PermissionCallback, ToolEvent, ToolExecutor,
};
pub use provider::{
    BlockAggregator, CompletionDelta, CompletionStream, LlmHandle, OpenAiProvider, Provider,
    ProviderRegistry,
};
pub use query::{QueryEvent, QueryLoop};
pub use tools::{Tool, ToolBuilder, ToolContext, ToolRegistry, ToolSchema, ToolYield, tool};
pub use types::{
    AssistantBlock, AssistantMessage, Message, ProgressMessage, TextBlock, ThinkingBlock,
    ToolResultBlock, ToolUseBlock, Usage, UserBlock, UserContent, UserMessage, normalize_messages,
};

/// Commonly used types and functions, importable in one line.
pub mod prelude {
    pub use crate::{
        AgentConfig, AgentRegistry, AssistantBlock, CancelHandle, Error, LlmHandle, Message,
        Provider, ProviderConfig, ProviderRegistry, QueryEvent, QueryLoop, Result, Tool,
        ToolContext, ToolExecutor, ToolRegistry, ToolResultBlock, ToolUseBlock, ToolYield,
        normalize_messages, tool,
    };
}
