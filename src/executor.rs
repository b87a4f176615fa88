//! Ordered, bounded-concurrent tool dispatch.
//!
//! Given the ordered `tool_use` batch of one assistant turn, the executor
//! produces the matching `tool_result` list while enforcing the scheduling
//! rules the conversation depends on:
//!
//! - The batch is partitioned left-to-right into maximal **safe runs** of
//!   consecutive tools that are both read-only and concurrency-safe. Any
//!   tool failing either predicate is a **barrier**.
//! - A safe run executes with up to [`MAX_CONCURRENT_TOOLS`] calls in
//!   flight; a barrier executes alone, after everything before it has
//!   completed. A write tool at position `i` therefore observes the
//!   filesystem state produced by positions `0..i`.
//! - Results are emitted in batch order no matter which call finishes
//!   first. Streaming yields (`progress`, `streaming_output`) are forwarded
//!   as they arrive, with no inter-tool ordering guarantee.
//!
//! Tool failures of every kind (schema rejection, semantic validation,
//! unknown name, permission denial, handler error, cancellation) surface
//! as a `tool_result` with `is_error: true`. The executor itself never
//! fails a batch; the model sees errors inline and decides what to do.
//!
//! Cancellation is cooperative: in-flight calls are raced against the
//! turn's [`CancelHandle`] and entries that have not started resolve to a
//! synthetic `"cancelled"` error result without being invoked.

use crate::cancel::CancelHandle;
use crate::tools::{OutputStream, ToolContext, ToolRegistry, ToolYield};
use crate::types::{ToolResultBlock, ToolUseBlock};
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Maximum tool calls in flight within one safe run.
pub const MAX_CONCURRENT_TOOLS: usize = 10;

/// Content of the synthetic error result for a cancelled tool call.
pub const CANCELLED_TOOL_RESULT: &str = "cancelled";

/// Host callback deciding whether a permission-gated tool may run.
/// Receives the tool name and input; resolves to `true` to allow.
pub type PermissionCallback =
    Arc<dyn Fn(&str, &Value) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Streaming event forwarded out of the executor while a batch runs.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// A progress note from one tool.
    Progress {
        tool_use_id: String,
        content: String,
    },

    /// One line of live subprocess output from one tool.
    StreamingOutput {
        tool_use_id: String,
        stream: OutputStream,
        line: String,
    },
}

/// Executor tuning knobs.
#[derive(Clone, Default)]
pub struct ExecutorOptions {
    /// Overrides [`MAX_CONCURRENT_TOOLS`] when set.
    pub max_concurrent: Option<usize>,

    /// Callback consulted for tools whose `needs_permissions` predicate
    /// fires. Absent callback means permission-gated calls are denied.
    pub permission_callback: Option<PermissionCallback>,
}

/// One scheduling unit of a batch: a range of consecutive entries, either
/// a concurrent safe run or a single barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Run {
    pub(crate) indices: Range<usize>,
    pub(crate) barrier: bool,
}

/// Partitions a batch into maximal safe runs and barriers.
///
/// Membership in a safe run requires `is_read_only() && is_concurrency_safe()`.
/// A name that resolves to no tool is scheduled as a barrier; it fails fast
/// with an error result either way, and the conservative classification
/// keeps scheduling independent of failure handling.
pub(crate) fn partition_runs(batch: &[ToolUseBlock], registry: &ToolRegistry) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut run_start: Option<usize> = None;

    for (index, block) in batch.iter().enumerate() {
        let safe = registry
            .get(&block.name)
            .map(|tool| tool.is_read_only() && tool.is_concurrency_safe())
            .unwrap_or(false);

        if safe {
            if run_start.is_none() {
                run_start = Some(index);
            }
        } else {
            if let Some(start) = run_start.take() {
                runs.push(Run {
                    indices: start..index,
                    barrier: false,
                });
            }
            runs.push(Run {
                indices: index..index + 1,
                barrier: true,
            });
        }
    }
    if let Some(start) = run_start {
        runs.push(Run {
            indices: start..batch.len(),
            barrier: false,
        });
    }

    runs
}

enum CallOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// The tool dispatch engine. Cheap to clone per turn; holds the registry
/// and options by value.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    options: ExecutorOptions,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_options(registry: ToolRegistry, options: ExecutorOptions) -> Self {
        Self { registry, options }
    }

    /// The registry this executor dispatches against.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Executes one batch and returns results in batch order.
    ///
    /// `events` receives streaming yields as they arrive; send failures
    /// (receiver dropped) are ignored so a disinterested caller costs
    /// nothing.
    pub async fn execute_batch(
        &self,
        batch: &[ToolUseBlock],
        ctx: &ToolContext,
        events: mpsc::Sender<ToolEvent>,
    ) -> Vec<ToolResultBlock> {
        let mut results: Vec<Option<ToolResultBlock>> = Vec::with_capacity(batch.len());
        results.resize_with(batch.len(), || None);

        let max_concurrent = self
            .options
            .max_concurrent
            .unwrap_or(MAX_CONCURRENT_TOOLS)
            .max(1);

        let runs = partition_runs(batch, &self.registry);
        tracing::debug!(
            batch = batch.len(),
            runs = runs.len(),
            "dispatching tool batch"
        );

        for run in runs {
            // Cancellation between runs: everything left resolves to a
            // synthetic error result without starting.
            if ctx.cancel.is_cancelled() {
                break;
            }

            if run.barrier {
                let index = run.indices.start;
                results[index] = Some(self.execute_one(&batch[index], ctx, &events).await);
            } else {
                let calls = run.indices.clone().map(|index| {
                    let block = &batch[index];
                    let events = events.clone();
                    async move { (index, self.execute_one(block, ctx, &events).await) }
                });
                let mut in_flight = futures::stream::iter(calls).buffer_unordered(max_concurrent);
                while let Some((index, result)) = in_flight.next().await {
                    results[index] = Some(result);
                }
            }
        }

        // Fill results for entries that never started (cancellation).
        batch
            .iter()
            .zip(results)
            .map(|(block, result)| {
                result.unwrap_or_else(|| {
                    ToolResultBlock::error(&block.id, CANCELLED_TOOL_RESULT)
                })
            })
            .collect()
    }

    /// Runs one entry through lookup, validation, permission gate, and the
    /// yield loop. Never returns an `Err`; failures become error results.
    async fn execute_one(
        &self,
        block: &ToolUseBlock,
        ctx: &ToolContext,
        events: &mpsc::Sender<ToolEvent>,
    ) -> ToolResultBlock {
        if ctx.cancel.is_cancelled() {
            return ToolResultBlock::error(&block.id, CANCELLED_TOOL_RESULT);
        }

        let Some(tool) = self.registry.get(&block.name) else {
            return ToolResultBlock::error(
                &block.id,
                format!("Tool '{}' not available", block.name),
            );
        };

        if let Err(message) = tool.validate_input(&block.input, ctx) {
            return ToolResultBlock::error(
                &block.id,
                format!("Input validation failed: {}", message),
            );
        }

        if tool.needs_permissions(&block.input) {
            let granted = match &self.options.permission_callback {
                Some(callback) => callback(&block.name, &block.input).await,
                None => false,
            };
            if !granted {
                return ToolResultBlock::error(
                    &block.id,
                    format!("Permission to use tool '{}' was denied", block.name),
                );
            }
        }

        tracing::debug!(tool = %block.name, id = %block.id, "executing tool");
        let started = Instant::now();
        let outcome = self
            .drive_call(tool.call(block.input.clone(), ctx.clone()), block, ctx, events)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            CallOutcome::Completed(content) => {
                ToolResultBlock::new(&block.id, content).with_duration(duration_ms)
            }
            CallOutcome::Failed(message) => {
                ToolResultBlock::error(&block.id, message).with_duration(duration_ms)
            }
            CallOutcome::Cancelled => ToolResultBlock::error(&block.id, CANCELLED_TOOL_RESULT),
        }
    }

    async fn drive_call(
        &self,
        mut stream: crate::tools::ToolYieldStream,
        block: &ToolUseBlock,
        ctx: &ToolContext,
        events: &mpsc::Sender<ToolEvent>,
    ) -> CallOutcome {
        let mut final_result: Option<String> = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    // A result that already arrived wins over the cancel;
                    // only the remaining cleanup is abandoned.
                    return match final_result {
                        Some(content) => CallOutcome::Completed(content),
                        None => CallOutcome::Cancelled,
                    };
                }
                yielded = stream.next() => match yielded {
                    None => break,
                    Some(Ok(ToolYield::Progress { content })) => {
                        let _ = events
                            .send(ToolEvent::Progress {
                                tool_use_id: block.id.clone(),
                                content,
                            })
                            .await;
                    }
                    Some(Ok(ToolYield::StreamingOutput { stream: out, line })) => {
                        let _ = events
                            .send(ToolEvent::StreamingOutput {
                                tool_use_id: block.id.clone(),
                                stream: out,
                                line,
                            })
                            .await;
                    }
                    Some(Ok(ToolYield::Result { result_for_assistant, .. })) => {
                        // Keep draining after the result so deferred
                        // cleanup inside the tool completes.
                        final_result = Some(result_for_assistant);
                    }
                    Some(Err(e)) => return CallOutcome::Failed(e.to_string()),
                },
            }
        }

        match final_result {
            Some(content) => CallOutcome::Completed(content),
            None => CallOutcome::Failed("Tool produced no result".to_string()),
        }
    }
}

/// Convenience constructor for a context sharing the executor's turn
/// cancel handle. Mirrors how the query loop builds contexts.
pub fn batch_context(cwd: impl Into<std::path::PathBuf>, cancel: CancelHandle) -> ToolContext {
    ToolContext::new(cwd).with_cancel(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, tool};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn read_tool() -> Tool {
        tool("Read", "Read a file")
            .param("path", "string")
            .read_only(true)
            .concurrency_safe(true)
            .build_result(|input, _ctx| async move {
                let path = input["path"].as_str().unwrap_or_default().to_string();
                Ok((json!({ "path": path }), format!("contents of {}", path)))
            })
    }

    fn write_tool() -> Tool {
        tool("Write", "Write a file")
            .param("path", "string")
            .build_result(|input, _ctx| async move {
                let path = input["path"].as_str().unwrap_or_default().to_string();
                Ok((json!({}), format!("wrote {}", path)))
            })
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::from_tools([read_tool(), write_tool()])
    }

    fn use_block(id: &str, name: &str, input: Value) -> ToolUseBlock {
        ToolUseBlock::new(id, name, input)
    }

    fn events() -> (mpsc::Sender<ToolEvent>, mpsc::Receiver<ToolEvent>) {
        mpsc::channel(64)
    }

    #[test]
    fn test_partition_reads_then_write() {
        let registry = registry();
        let batch = vec![
            use_block("1", "Read", json!({"path": "x"})),
            use_block("2", "Read", json!({"path": "y"})),
            use_block("3", "Write", json!({"path": "z"})),
        ];
        let runs = partition_runs(&batch, &registry);
        assert_eq!(
            runs,
            vec![
                Run { indices: 0..2, barrier: false },
                Run { indices: 2..3, barrier: true },
            ]
        );
    }

    #[test]
    fn test_partition_unknown_tool_is_barrier() {
        let registry = registry();
        let batch = vec![
            use_block("1", "Nope", json!({})),
            use_block("2", "Read", json!({"path": "y"})),
        ];
        let runs = partition_runs(&batch, &registry);
        assert!(runs[0].barrier);
        assert!(!runs[1].barrier);
    }

    #[test]
    fn test_partition_interleaved() {
        let registry = registry();
        let batch = vec![
            use_block("1", "Write", json!({"path": "a"})),
            use_block("2", "Read", json!({"path": "b"})),
            use_block("3", "Read", json!({"path": "c"})),
            use_block("4", "Write", json!({"path": "d"})),
            use_block("5", "Read", json!({"path": "e"})),
        ];
        let runs = partition_runs(&batch, &registry);
        assert_eq!(runs.len(), 4);
        assert!(runs[0].barrier);
        assert_eq!(runs[1].indices, 1..3);
        assert!(runs[2].barrier);
        assert_eq!(runs[3].indices, 4..5);
    }

    #[tokio::test]
    async fn test_results_in_batch_order() {
        // First read sleeps so it finishes last; order must still hold.
        let slow_then_fast = tool("Read", "Read a file")
            .param("path", "string")
            .read_only(true)
            .concurrency_safe(true)
            .build_result(|input, _ctx| async move {
                let path = input["path"].as_str().unwrap_or_default().to_string();
                if path == "slow" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok((json!({}), path))
            });
        let executor = ToolExecutor::new(ToolRegistry::from_tools([slow_then_fast]));
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![
            use_block("1", "Read", json!({"path": "slow"})),
            use_block("2", "Read", json!({"path": "fast"})),
        ];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert_eq!(results[0].tool_use_id, "1");
        assert_eq!(results[0].content, "slow");
        assert_eq!(results[1].tool_use_id, "2");
        assert_eq!(results[1].content, "fast");
    }

    #[tokio::test]
    async fn test_unknown_tool_error_result() {
        let executor = ToolExecutor::new(registry());
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Missing", json!({}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("Tool 'Missing' not available"));
    }

    #[tokio::test]
    async fn test_validation_failure_skips_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_probe = calls.clone();
        let counting = tool("Count", "Counts invocations")
            .param("n", "integer")
            .read_only(true)
            .concurrency_safe(true)
            .build_result(move |_input, _ctx| {
                let calls = calls_probe.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((json!({}), "counted".to_string()))
                }
            });
        let executor = ToolExecutor::new(ToolRegistry::from_tools([counting]));
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Count", json!({"n": "not an int"}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("Input validation failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_without_callback() {
        let gated = tool("Bash", "Run a command")
            .param("command", "string")
            .needs_permissions(|_| true)
            .build_result(|_, _| async { Ok((json!({}), "ran".to_string())) });
        let executor = ToolExecutor::new(ToolRegistry::from_tools([gated]));
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Bash", json!({"command": "ls"}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("denied"));
    }

    #[tokio::test]
    async fn test_permission_callback_grants() {
        let gated = tool("Bash", "Run a command")
            .param("command", "string")
            .needs_permissions(|_| true)
            .build_result(|_, _| async { Ok((json!({}), "ran".to_string())) });
        let options = ExecutorOptions {
            permission_callback: Some(Arc::new(|_name, _input| Box::pin(async { true }))),
            ..Default::default()
        };
        let executor = ToolExecutor::with_options(ToolRegistry::from_tools([gated]), options);
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Bash", json!({"command": "ls"}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(!results[0].is_error);
        assert_eq!(results[0].content, "ran");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_result() {
        let failing = tool("Fail", "Always fails")
            .read_only(true)
            .concurrency_safe(true)
            .build_result(|_, _| async { Err(crate::Error::tool("boom")) });
        let executor = ToolExecutor::new(ToolRegistry::from_tools([failing]));
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Fail", json!({}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("boom"));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let executor = ToolExecutor::new(registry());
        let cancel = CancelHandle::new();
        cancel.cancel();
        let ctx = batch_context("/tmp", cancel);
        let (tx, _rx) = events();

        let batch = vec![
            use_block("1", "Read", json!({"path": "a"})),
            use_block("2", "Write", json!({"path": "b"})),
        ];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.is_error);
            assert_eq!(result.content, CANCELLED_TOOL_RESULT);
        }
        // Original order preserved.
        assert_eq!(results[0].tool_use_id, "1");
        assert_eq!(results[1].tool_use_id, "2");
    }

    #[tokio::test]
    async fn test_progress_forwarded() {
        let noisy = tool("Noisy", "Yields progress then a result")
            .read_only(true)
            .concurrency_safe(true)
            .build(|_input, _ctx| {
                Box::pin(futures::stream::iter(vec![
                    Ok(ToolYield::Progress {
                        content: "halfway".to_string(),
                    }),
                    Ok(ToolYield::Result {
                        data: json!({}),
                        result_for_assistant: "done".to_string(),
                    }),
                ]))
            });
        let executor = ToolExecutor::new(ToolRegistry::from_tools([noisy]));
        let ctx = ToolContext::new("/tmp");
        let (tx, mut rx) = events();

        let batch = vec![use_block("1", "Noisy", json!({}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert_eq!(results[0].content, "done");

        let event = rx.recv().await.expect("progress event");
        match event {
            ToolEvent::Progress {
                tool_use_id,
                content,
            } => {
                assert_eq!(tool_use_id, "1");
                assert_eq!(content, "halfway");
            }
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_duration_recorded() {
        let executor = ToolExecutor::new(registry());
        let ctx = ToolContext::new("/tmp");
        let (tx, _rx) = events();

        let batch = vec![use_block("1", "Read", json!({"path": "a"}))];
        let results = executor.execute_batch(&batch, &ctx, tx).await;
        assert!(results[0].duration_ms.is_some());
    }
}
