//! Query-loop scenarios: single read, recursion, termination, and
//! cancellation during streaming.

mod common;

use common::{Script, scripted_llm, text_turn, tool_call_turn};
use panpan::executor::ToolExecutor;
use panpan::provider::CompletionDelta;
use panpan::tools::{ToolContext, ToolRegistry, tool};
use panpan::types::Message;
use panpan::{CancelHandle, QueryEvent, QueryLoop};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn read_registry() -> ToolRegistry {
    ToolRegistry::from_tools([tool("Read", "Read a file")
        .param("path", "string")
        .read_only(true)
        .concurrency_safe(true)
        .build_result(|input, _ctx| async move {
            let path = input["path"].as_str().unwrap_or_default();
            let content = if path == "/tmp/a.txt" { "hello" } else { "" };
            Ok((json!({ "content": content }), content.to_string()))
        })])
}

fn event_sink() -> mpsc::Sender<QueryEvent> {
    mpsc::channel(64).0
}

#[tokio::test]
async fn single_read_scenario() {
    // Model asks for one Read, then answers from its result.
    let llm = scripted_llm(vec![
        tool_call_turn(&[("toolu_1", "Read", r#"{"path":"/tmp/a.txt"}"#)]),
        text_turn("The file contains: hello"),
    ]);
    let query = QueryLoop::new(llm, ToolExecutor::new(read_registry()));
    let ctx = ToolContext::new("/tmp");

    let conversation = query
        .run_turn(vec![Message::user("read /tmp/a.txt")], &ctx, event_sink())
        .await
        .unwrap();

    assert_eq!(conversation.len(), 4);

    let Message::User(results) = &conversation[2] else {
        panic!("expected tool result message");
    };
    let result = results.tool_results().next().unwrap();
    assert_eq!(result.tool_use_id, "toolu_1");
    assert_eq!(result.content, "hello");
    assert!(!result.is_error);

    let Message::Assistant(final_message) = &conversation[3] else {
        panic!("expected final assistant message");
    };
    assert_eq!(final_message.text(), "The file contains: hello");
}

#[tokio::test]
async fn parallel_reads_one_batch() {
    let llm = scripted_llm(vec![
        tool_call_turn(&[
            ("t1", "Read", r#"{"path":"/tmp/a.txt"}"#),
            ("t2", "Read", r#"{"path":"/tmp/b.txt"}"#),
            ("t3", "Read", r#"{"path":"/tmp/c.txt"}"#),
        ]),
        text_turn("done"),
    ]);
    let query = QueryLoop::new(llm, ToolExecutor::new(read_registry()));
    let ctx = ToolContext::new("/tmp");

    let conversation = query
        .run_turn(vec![Message::user("read them all")], &ctx, event_sink())
        .await
        .unwrap();

    let Message::User(results) = &conversation[2] else {
        panic!("expected tool result message");
    };
    let ids: Vec<_> = results.tool_results().map(|r| r.tool_use_id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert!(results.tool_results().all(|r| !r.is_error));
}

#[tokio::test]
async fn no_tool_use_terminates_without_user_message() {
    let llm = scripted_llm(vec![text_turn("just an answer")]);
    let query = QueryLoop::new(llm, ToolExecutor::new(read_registry()));
    let ctx = ToolContext::new("/tmp");

    let conversation = query
        .run_turn(vec![Message::user("hi")], &ctx, event_sink())
        .await
        .unwrap();

    // user + assistant only; batch of size 0 emits no user message.
    assert_eq!(conversation.len(), 2);
    assert!(matches!(&conversation[1], Message::Assistant(_)));
}

#[tokio::test]
async fn cancellation_during_llm_stream() {
    // The stream delivers a complete tool call, then hangs with no finish
    // reason. Cancelling must salvage the tool use and synthesize a
    // cancelled result for it.
    let llm = scripted_llm(vec![Script::hanging(vec![CompletionDelta::ToolCall {
        index: 0,
        id: Some("toolu_x".to_string()),
        name: Some("Read".to_string()),
        arguments: Some(r#"{"path":"/tmp/a.txt"}"#.to_string()),
    }])]);
    let query = QueryLoop::new(llm, ToolExecutor::new(read_registry()));
    let cancel = CancelHandle::new();
    let ctx = ToolContext::new("/tmp").with_cancel(cancel.clone());

    let task = tokio::spawn({
        let query = query.clone();
        async move {
            query
                .run_turn(vec![Message::user("read it")], &ctx, event_sink())
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(80)).await;
    cancel.cancel();

    let conversation = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancellation must end the turn")
        .unwrap()
        .unwrap();

    // user, salvaged assistant, synthesized results.
    assert_eq!(conversation.len(), 3);
    let Message::Assistant(assistant) = &conversation[1] else {
        panic!("expected salvaged assistant message");
    };
    assert_eq!(assistant.tool_uses()[0].id, "toolu_x");

    let Message::User(results) = &conversation[2] else {
        panic!("expected synthesized results");
    };
    let result = results.tool_results().next().unwrap();
    assert_eq!(result.tool_use_id, "toolu_x");
    assert!(result.is_error);
    assert_eq!(result.content, "cancelled");
}

#[tokio::test]
async fn cancellation_before_call_produces_nothing() {
    let llm = scripted_llm(vec![text_turn("never")]);
    let query = QueryLoop::new(llm, ToolExecutor::new(read_registry()));
    let cancel = CancelHandle::new();
    cancel.cancel();
    let ctx = ToolContext::new("/tmp").with_cancel(cancel);

    let conversation = query
        .run_turn(vec![Message::user("hi")], &ctx, event_sink())
        .await
        .unwrap();
    assert_eq!(conversation.len(), 1);
}

#[tokio::test]
async fn progress_events_reach_the_caller() {
    use futures::stream;
    use panpan::tools::ToolYield;

    let noisy = tool("Noisy", "emits progress")
        .read_only(true)
        .concurrency_safe(true)
        .build(|_input, _ctx| {
            Box::pin(stream::iter(vec![
                Ok(ToolYield::Progress {
                    content: "step 1".to_string(),
                }),
                Ok(ToolYield::Result {
                    data: json!({}),
                    result_for_assistant: "ok".to_string(),
                }),
            ]))
        });
    let llm = scripted_llm(vec![
        tool_call_turn(&[("t1", "Noisy", "{}")]),
        text_turn("done"),
    ]);
    let query = QueryLoop::new(llm, ToolExecutor::new(ToolRegistry::from_tools([noisy])));
    let ctx = ToolContext::new("/tmp");
    let (tx, mut rx) = mpsc::channel(64);

    let collector = tokio::spawn(async move {
        let mut progress = Vec::new();
        while let Some(event) = rx.recv().await {
            if let QueryEvent::Progress(p) = event {
                progress.push(p.content);
            }
        }
        progress
    });

    query
        .run_turn(vec![Message::user("go")], &ctx, tx)
        .await
        .unwrap();

    let progress = collector.await.unwrap();
    assert_eq!(progress, vec!["step 1"]);
}
