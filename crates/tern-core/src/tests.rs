// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Scenario tests for the full turn loop: runtime → executor → tools →
/// events.
///
/// Uses `ScriptedAdapter` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod runtime_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use tern_config::{ApprovalMode, Settings, ToolPolicies};
    use tern_events::{AgentEvent, ApprovalStatus, EventBus, EventEnvelope, RunCompleteReason};
    use tern_model::{
        ContentPart, ModelRegistry, ProviderAdapter, ProviderEvent, ProviderStream, Role,
        ScriptedAdapter,
    };
    use tern_store::{InMemoryBlobStore, InMemoryHistory};
    use tern_tools::{
        ApprovalHandler, ApprovalManager, InMemoryAllowedTools, StaticApprovalHandler, Tool,
        ToolError, ToolExecutionContext, ToolId, ToolManager,
    };

    use crate::{
        AgentRuntime, CompactionStrategy, KeepRecentCompaction, NoopCompaction, RuntimeError,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct EchoTool {
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> ToolId {
            ToolId::internal("echo")
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(&self, args: Value, _ctx: &ToolExecutionContext) -> Result<Value, ToolError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            Ok(json!({ "text": args["text"] }))
        }
    }

    struct DangerousTool;

    #[async_trait]
    impl Tool for DangerousTool {
        fn id(&self) -> ToolId {
            ToolId::custom("dangerous")
        }
        fn description(&self) -> &str {
            "does something that needs a human decision"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value, _ctx: &ToolExecutionContext) -> Result<Value, ToolError> {
            Ok(json!("armed"))
        }
    }

    /// Emits one chunk, then hangs until cancelled.
    struct PendingAdapter;

    #[async_trait]
    impl ProviderAdapter for PendingAdapter {
        fn name(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "mock-model"
        }
        async fn stream(
            &self,
            _req: tern_model::CompletionRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ProviderStream> {
            let head = futures::stream::iter(vec![Ok(ProviderEvent::Chunk {
                text: "partial".into(),
            })]);
            Ok(Box::pin(head.chain(futures::stream::pending())))
        }
    }

    struct Harness {
        runtime: Arc<AgentRuntime>,
        tools: Arc<ToolManager>,
    }

    fn harness(
        provider: Arc<dyn ProviderAdapter>,
        settings: Settings,
        handler: Arc<dyn ApprovalHandler>,
        strategy: Arc<dyn CompactionStrategy>,
        echo_delay_ms: u64,
    ) -> Harness {
        let validated = settings.validated().unwrap();
        let bus = EventBus::new(validated.per_stream_queue_capacity);
        let approvals = ApprovalManager::new(handler, bus.clone(), validated.approval_timeout_ms);
        let tools = Arc::new(ToolManager::new(
            bus.clone(),
            approvals,
            Arc::new(InMemoryAllowedTools::default()),
            validated.approval_mode,
            validated.tool_policies.clone(),
            validated.background_tasks,
        ));
        tools.register_tool(Arc::new(EchoTool { delay_ms: echo_delay_ms })).unwrap();
        let runtime = AgentRuntime::new(
            validated,
            bus,
            provider,
            tools.clone(),
            Arc::new(InMemoryHistory::new()),
            Arc::new(InMemoryBlobStore::new()),
            strategy,
            &ModelRegistry::new(),
        );
        Harness { runtime, tools }
    }

    fn default_harness(provider: Arc<dyn ProviderAdapter>) -> Harness {
        harness(
            provider,
            Settings { approval_mode: ApprovalMode::AutoApprove, ..Settings::default() },
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(NoopCompaction),
            0,
        )
    }

    fn text(s: impl Into<String>) -> Vec<ContentPart> {
        vec![ContentPart::text(s.into())]
    }

    fn kinds(events: &[EventEnvelope]) -> Vec<&'static str> {
        events.iter().map(|e| e.event.kind()).collect()
    }

    async fn wait_idle(runtime: &AgentRuntime, session: &str) {
        for _ in 0..200 {
            if !runtime.is_busy(session) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("session `{session}` never went idle");
    }

    // ── S1: simple text turn ──────────────────────────────────────────────────

    #[tokio::test]
    async fn simple_text_turn_event_sequence() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        let stream = h.runtime.stream("s1", text("hello")).await.unwrap();
        let events = stream.collect_events().await;
        assert_eq!(
            kinds(&events),
            vec!["llm:thinking", "llm:chunk", "llm:response", "run:complete"]
        );
        assert!(matches!(
            events.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::Ok }
        ));
    }

    #[tokio::test]
    async fn generate_returns_final_content() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        let resp = h.runtime.generate("s1", text("hello")).await.unwrap();
        assert_eq!(resp.content, "hi");
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.session_id, "s1");
        assert!(resp.usage.total > 0);
    }

    // ── S2: tool call allowed by policy ───────────────────────────────────────

    #[tokio::test]
    async fn tool_call_with_always_allow_runs_without_rendezvous() {
        // The handler denies everything, proving the allow list decides.
        let h = harness(
            Arc::new(ScriptedAdapter::tool_then_text(
                "c1",
                "internal--echo",
                json!({ "text": "x" }),
                "done",
            )),
            Settings {
                approval_mode: ApprovalMode::Manual,
                tool_policies: ToolPolicies {
                    always_allow: vec!["internal--echo".into()],
                    always_deny: vec![],
                },
                ..Settings::default()
            },
            Arc::new(StaticApprovalHandler::denying()),
            Arc::new(NoopCompaction),
            0,
        );
        let stream = h.runtime.stream("s2", text("echo x")).await.unwrap();
        let events = stream.collect_events().await;
        let ks = kinds(&events);
        assert!(!ks.contains(&"approval:request"));

        let call_pos = ks.iter().position(|k| *k == "llm:tool-call").unwrap();
        let running_pos = ks.iter().position(|k| *k == "tool:running").unwrap();
        let result_pos = ks.iter().position(|k| *k == "llm:tool-result").unwrap();
        assert!(call_pos < running_pos && running_pos < result_pos);

        let result = events
            .iter()
            .find_map(|e| match &e.event {
                AgentEvent::LlmToolResult { success, sanitized, call_id, .. } => {
                    Some((*success, sanitized.clone(), call_id.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(result, (true, json!({ "text": "x" }), "c1".to_string()));
        assert!(matches!(
            events.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::Ok }
        ));
    }

    #[tokio::test]
    async fn tool_turn_history_pairs_calls_with_results() {
        let h = default_harness(Arc::new(ScriptedAdapter::tool_then_text(
            "c1",
            "internal--echo",
            json!({ "text": "x" }),
            "done",
        )));
        h.runtime.generate("s2", text("echo x")).await.unwrap();
        let history = h.runtime.get_history("s2").await.unwrap();
        let call_index = history
            .iter()
            .position(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
            .unwrap();
        // Every call is answered before the next assistant message.
        let next_assistant = history[call_index + 1..]
            .iter()
            .position(|m| m.role == Role::Assistant)
            .map(|i| call_index + 1 + i)
            .unwrap_or(history.len());
        for call in &history[call_index].tool_calls {
            assert!(
                history[call_index + 1..next_assistant].iter().any(|m| {
                    m.role == Role::Tool && m.tool_call_id.as_deref() == Some(&call.call_id)
                }),
                "call {} has no tool result before the next assistant message",
                call.call_id
            );
        }
    }

    // ── S3: manual approval denied ────────────────────────────────────────────

    #[tokio::test]
    async fn manual_denial_is_in_band_not_an_exception() {
        let h = harness(
            Arc::new(ScriptedAdapter::tool_then_text(
                "c2",
                "custom--dangerous",
                json!({}),
                "understood, skipping that",
            )),
            Settings { approval_mode: ApprovalMode::Manual, ..Settings::default() },
            Arc::new(StaticApprovalHandler::denying()),
            Arc::new(NoopCompaction),
            0,
        );
        h.tools.register_tool(Arc::new(DangerousTool)).unwrap();

        let stream = h.runtime.stream("s3", text("do the thing")).await.unwrap();
        let events = stream.collect_events().await;
        let ks = kinds(&events);
        assert!(ks.contains(&"approval:request"));
        assert!(ks.contains(&"approval:response"));
        let denied = events.iter().any(|e| {
            matches!(
                e.event,
                AgentEvent::ApprovalResolved { status: ApprovalStatus::Denied, .. }
            )
        });
        assert!(denied);
        let failed = events.iter().any(|e| {
            matches!(e.event, AgentEvent::LlmToolResult { success: false, ref call_id, .. } if call_id == "c2")
        });
        assert!(failed);
        assert!(matches!(
            events.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::Ok }
        ));
    }

    // ── S4: cancellation mid-stream ───────────────────────────────────────────

    #[tokio::test]
    async fn cancel_mid_stream_closes_iterator() {
        let h = default_harness(Arc::new(PendingAdapter));
        let mut stream = h.runtime.stream("s4", text("hello")).await.unwrap();

        let mut saw_chunk = false;
        let mut tail = Vec::new();
        while let Some(env) = stream.next().await {
            if matches!(env.event, AgentEvent::LlmChunk { .. }) && !saw_chunk {
                saw_chunk = true;
                assert!(h.runtime.cancel("s4"), "cancel should report a live run");
            }
            tail.push(env);
        }
        assert!(saw_chunk);
        assert!(matches!(
            tail.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::Cancelled }
        ));

        wait_idle(&h.runtime, "s4").await;
        assert!(!h.runtime.cancel("s4"), "cancelling a completed turn is a no-op");
        assert!(!h.runtime.is_busy("s4"));
        // Partial text was committed for the next turn.
        let history = h.runtime.get_history("s4").await.unwrap();
        assert!(history.iter().any(|m| m.as_text() == Some("partial")));
    }

    #[tokio::test]
    async fn cancel_unknown_session_returns_false() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        assert!(!h.runtime.cancel("never-seen"));
    }

    // ── S5: queued message delivered next iteration ───────────────────────────

    #[tokio::test]
    async fn queued_message_is_drained_between_iterations() {
        let h = harness(
            Arc::new(ScriptedAdapter::tool_then_text(
                "c1",
                "internal--echo",
                json!({ "text": "x" }),
                "done",
            )),
            Settings { approval_mode: ApprovalMode::AutoApprove, ..Settings::default() },
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(NoopCompaction),
            100,
        );
        let mut stream = h.runtime.stream("s5", text("do X")).await.unwrap();
        let mut events = Vec::new();
        while let Some(env) = stream.next().await {
            if matches!(env.event, AgentEvent::ToolRunning { .. }) {
                // The tool sleeps; the session is busy, so queueing is legal.
                h.runtime.queue_message("s5", text("and also do Y")).await.unwrap();
            }
            events.push(env);
        }
        let ks = kinds(&events);
        let queued = ks.iter().position(|k| *k == "message:queued").unwrap();
        let dequeued = ks.iter().position(|k| *k == "message:dequeued").unwrap();
        let second_thinking = ks.iter().rposition(|k| *k == "llm:thinking").unwrap();
        assert!(queued < dequeued && dequeued < second_thinking);

        // The drained message became a user message in history.
        let history = h.runtime.get_history("s5").await.unwrap();
        assert!(history
            .iter()
            .any(|m| m.role == Role::User && m.as_text() == Some("and also do Y")));
    }

    #[tokio::test]
    async fn queueing_against_idle_session_is_rejected() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        h.runtime.generate("s5b", text("hello")).await.unwrap();
        wait_idle(&h.runtime, "s5b").await;
        let err = h.runtime.queue_message("s5b", text("later")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SessionIdle(_)));
    }

    // ── S6: compaction on overflow ────────────────────────────────────────────

    #[tokio::test]
    async fn compaction_triggers_before_model_call_on_overflow() {
        // mock-model window is 32k; threshold 0.5 → 16k tokens.  Each turn
        // adds a ~7k-token user message, and the scripted usage reports the
        // growing input so the actuals-anchored estimate crosses the
        // threshold on the third turn.
        let scripts = (0..5u32)
            .map(|i| {
                vec![
                    ProviderEvent::Chunk { text: format!("r{i}") },
                    ProviderEvent::Response {
                        content: vec![ContentPart::text(format!("r{i}"))],
                        reasoning: None,
                        usage: tern_model::TokenUsage::new((i + 1) * 7_000, 10),
                    },
                ]
            })
            .collect();
        let h = harness(
            Arc::new(ScriptedAdapter::new(scripts)),
            Settings {
                approval_mode: ApprovalMode::AutoApprove,
                threshold_percent: 0.5,
                ..Settings::default()
            },
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(KeepRecentCompaction { keep_recent: 2 }),
            0,
        );
        let big = "x".repeat(28_000);

        let mut compaction_events = Vec::new();
        for _ in 0..4 {
            let stream = h.runtime.stream("s6", text(big.clone())).await.unwrap();
            let events = stream.collect_events().await;
            let ks = kinds(&events);
            if let Some(pos) = ks.iter().position(|k| *k == "context:compacting") {
                let thinking = ks.iter().position(|k| *k == "llm:thinking").unwrap();
                assert!(pos < thinking, "compaction must precede the model call");
                compaction_events = events;
                break;
            }
            wait_idle(&h.runtime, "s6").await;
        }
        let compacted = compaction_events
            .iter()
            .find_map(|e| match &e.event {
                AgentEvent::ContextCompacted { original_messages, compacted_messages, strategy, .. } => {
                    Some((*original_messages, *compacted_messages, strategy.clone()))
                }
                _ => None,
            })
            .expect("no context:compacted in any turn");
        let (original, after, strategy) = compacted;
        assert_eq!(strategy, "keep-recent");
        // One summary replaces the covered prefix.
        assert!(after <= original - 1, "summary must shrink the filtered view");
        let stats = h.runtime.get_context_stats("s6").await.unwrap();
        assert!(stats.has_summary);
    }

    // ── Boundary behaviors ────────────────────────────────────────────────────

    #[tokio::test]
    async fn max_iterations_one_never_dispatches_tools() {
        let h = harness(
            Arc::new(ScriptedAdapter::tool_then_text(
                "c1",
                "internal--echo",
                json!({ "text": "x" }),
                "done",
            )),
            Settings {
                approval_mode: ApprovalMode::AutoApprove,
                max_iterations: 1,
                ..Settings::default()
            },
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(NoopCompaction),
            0,
        );
        let stream = h.runtime.stream("s7", text("go")).await.unwrap();
        let events = stream.collect_events().await;
        let ks = kinds(&events);
        assert!(!ks.contains(&"tool:running"));
        assert!(!ks.contains(&"llm:tool-result"));
        assert!(matches!(
            events.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::IterCap }
        ));
        // The terminal response is the iteration-cap notice.
        let last_response = events
            .iter()
            .rev()
            .find_map(|e| match &e.event {
                AgentEvent::LlmResponse { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(last_response.contains("maximum of 1"));
    }

    #[tokio::test]
    async fn empty_content_is_a_validation_error_without_side_effects() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        let err = h.runtime.stream("s8", vec![]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
        let err = h.runtime.stream("s8", text("   ")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
        // No session state was created.
        assert!(matches!(
            h.runtime.get_context_stats("s8").await,
            Err(RuntimeError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn second_stream_on_busy_session_is_rejected() {
        let h = default_harness(Arc::new(PendingAdapter));
        let _stream = h.runtime.stream("s9", text("first")).await.unwrap();
        let err = h.runtime.stream("s9", text("second")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::SessionBusy(_)));
        h.runtime.cancel("s9");
        wait_idle(&h.runtime, "s9").await;
    }

    #[tokio::test]
    async fn fatal_provider_error_surfaces_through_generate() {
        let h = default_harness(Arc::new(ScriptedAdapter::new(vec![vec![
            ProviderEvent::Error { recoverable: false, message: "model exploded".into() },
        ]])));
        let err = h.runtime.generate("s10", text("hello")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Provider(ref m) if m.contains("model exploded")));
    }

    #[tokio::test]
    async fn recoverable_provider_error_does_not_end_the_turn() {
        let h = default_harness(Arc::new(ScriptedAdapter::new(vec![vec![
            ProviderEvent::Error { recoverable: true, message: "hiccup".into() },
            ProviderEvent::Chunk { text: "recovered".into() },
            ProviderEvent::Response {
                content: vec![ContentPart::text("recovered")],
                reasoning: None,
                usage: tern_model::TokenUsage::new(5, 5),
            },
        ]])));
        let resp = h.runtime.generate("s11", text("hello")).await.unwrap();
        assert_eq!(resp.content, "recovered");
    }

    #[tokio::test]
    async fn threshold_one_never_compacts() {
        let h = harness(
            Arc::new(ScriptedAdapter::new(
                (0..3).map(|i| ScriptedAdapter::text_script(&format!("r{i}"))).collect(),
            )),
            Settings::default(), // threshold_percent = 1.0
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(KeepRecentCompaction { keep_recent: 1 }),
            0,
        );
        let big = "x".repeat(120_000); // only ~30k tokens fit the mock window
        for _ in 0..3 {
            let stream = h.runtime.stream("s12", text(big.clone())).await.unwrap();
            let events = stream.collect_events().await;
            assert!(!kinds(&events).contains(&"context:compacting"));
            wait_idle(&h.runtime, "s12").await;
        }
    }

    #[tokio::test]
    async fn per_iteration_responses_are_emitted() {
        let h = default_harness(Arc::new(ScriptedAdapter::tool_then_text(
            "c1",
            "internal--echo",
            json!({ "text": "x" }),
            "done",
        )));
        let stream = h.runtime.stream("s13", text("go")).await.unwrap();
        let events = stream.collect_events().await;
        let responses = events
            .iter()
            .filter(|e| matches!(e.event, AgentEvent::LlmResponse { .. }))
            .count();
        assert_eq!(responses, 2, "one llm:response per iteration");
    }

    #[tokio::test]
    async fn session_title_derives_from_first_message() {
        let h = default_harness(Arc::new(ScriptedAdapter::always_text("hi")));
        // Title updates go to observers of the whole session, not the turn
        // stream (which starts after titling).
        let mut titles = h
            .runtime
            .bus()
            .subscribe(tern_events::EventFilter::named(vec!["session:title-updated"]));
        let stream = h
            .runtime
            .stream("s14", text("summarize the quarterly report for me please"))
            .await
            .unwrap();
        stream.collect_events().await;
        let env = titles.recv().await.unwrap();
        assert!(matches!(env.event, AgentEvent::SessionTitleUpdated { .. }));
        let title = h.runtime.title("s14").unwrap();
        assert!(title.starts_with("summarize the quarterly"));
        assert!(title.len() <= 48);
    }

    #[tokio::test]
    async fn manual_compaction_returns_outcome() {
        let h = harness(
            Arc::new(ScriptedAdapter::new(
                (0..8).map(|i| ScriptedAdapter::text_script(&format!("r{i}"))).collect(),
            )),
            Settings { approval_mode: ApprovalMode::AutoApprove, ..Settings::default() },
            Arc::new(StaticApprovalHandler::approving()),
            Arc::new(KeepRecentCompaction { keep_recent: 2 }),
            0,
        );
        for i in 0..4 {
            h.runtime.generate("s15", text(format!("message {i}"))).await.unwrap();
            wait_idle(&h.runtime, "s15").await;
        }
        let outcome = h.runtime.compact_context("s15").await.unwrap().unwrap();
        assert!(outcome.compacted_messages < outcome.original_messages);
        let stats = h.runtime.get_context_stats("s15").await.unwrap();
        assert!(stats.has_summary);
        assert_eq!(stats.filtered_message_count, outcome.compacted_messages);
    }

    #[tokio::test]
    async fn clear_context_emits_event_and_hides_history() {
        let h = default_harness(Arc::new(ScriptedAdapter::new(vec![
            ScriptedAdapter::text_script("one"),
            ScriptedAdapter::text_script("two"),
        ])));
        h.runtime.generate("s16", text("first")).await.unwrap();
        wait_idle(&h.runtime, "s16").await;
        h.runtime.clear_context("s16").await.unwrap();
        let stats = h.runtime.get_context_stats("s16").await.unwrap();
        assert_eq!(stats.filtered_message_count, 1); // just the marker
        assert!(stats.message_count > 1); // storage keeps everything
    }

    #[tokio::test]
    async fn malformed_tool_call_deltas_surface_their_parse_failure() {
        // Index 0 streams deltas but never gets a function name; index 1
        // finalizes and runs.  The failure must name the call that broke,
        // not the one that succeeded.
        let h = default_harness(Arc::new(ScriptedAdapter::new(vec![
            vec![
                ProviderEvent::ToolCallPartial {
                    index: 0,
                    id: Some("c0".into()),
                    name: None,
                    args_delta: r#"{"a":1}"#.into(),
                },
                ProviderEvent::ToolCallPartial {
                    index: 1,
                    id: Some("c1".into()),
                    name: Some("internal--echo".into()),
                    args_delta: r#"{"text":"x"}"#.into(),
                },
                ProviderEvent::ToolCallFinal {
                    id: "c1".into(),
                    name: "internal--echo".into(),
                    args: json!({ "text": "x" }),
                },
                ProviderEvent::Response {
                    content: Vec::new(),
                    reasoning: None,
                    usage: tern_model::TokenUsage::new(5, 5),
                },
            ],
            ScriptedAdapter::text_script("done"),
        ])));
        let stream = h.runtime.stream("s17", text("go")).await.unwrap();
        let events = stream.collect_events().await;

        let (failed_id, payload) = events
            .iter()
            .find_map(|e| match &e.event {
                AgentEvent::LlmToolResult { success: false, call_id, sanitized, .. } => {
                    Some((call_id.clone(), sanitized.clone()))
                }
                _ => None,
            })
            .expect("no failure surfaced for the incomplete call");
        assert_eq!(failed_id, "c0");
        assert!(payload["error"].as_str().unwrap().contains("missing function name"));

        // The well-formed call still dispatched, exactly once.
        let succeeded: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(&e.event, AgentEvent::LlmToolResult { success: true, call_id, .. } if call_id == "c1")
            })
            .collect();
        assert_eq!(succeeded.len(), 1);
        assert!(matches!(
            events.last().unwrap().event,
            AgentEvent::RunComplete { reason: RunCompleteReason::Ok }
        ));
    }

    #[tokio::test]
    async fn unfinalized_but_parseable_deltas_are_recovered() {
        // The adapter streams complete deltas for a call but never emits the
        // final; the loop assembles and dispatches it anyway.
        let h = default_harness(Arc::new(ScriptedAdapter::new(vec![
            vec![
                ProviderEvent::ToolCallPartial {
                    index: 0,
                    id: Some("c9".into()),
                    name: Some("internal--echo".into()),
                    args_delta: r#"{"text":"recovered"}"#.into(),
                },
                ProviderEvent::Response {
                    content: Vec::new(),
                    reasoning: None,
                    usage: tern_model::TokenUsage::new(5, 5),
                },
            ],
            ScriptedAdapter::text_script("done"),
        ])));
        let resp = h.runtime.generate("s18", text("go")).await.unwrap();
        assert_eq!(resp.content, "done");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].call_id, "c9");
        let history = h.runtime.get_history("s18").await.unwrap();
        assert!(history
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("c9")));
    }
}
