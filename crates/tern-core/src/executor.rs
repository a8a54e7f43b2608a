// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-turn state machine: a bounded loop of model calls and tool
//! dispatches.
//!
//! Everything the caller observes goes over the bus; the executor itself
//! never returns errors for anything that happens after the turn started.
//! Fatal conditions become `llm:error{recoverable:false}` followed by
//! `run:complete{error}`, cancellation becomes `run:complete{cancelled}`,
//! and every path ends with exactly one `run:complete`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use tern_config::ValidatedSettings;
use tern_events::{AgentEvent, CompactionReason, EventBus, EventEnvelope, RunCompleteReason};
use tern_model::{
    CompletionRequest, ContentPart, MalformedToolCall, MessageMetadata, ModelInfo,
    ProviderAdapter, ProviderEvent, TokenUsage, ToolCallAssembler, ToolCallRequest, ToolSchema,
};
use tern_store::StoreError;
use tern_tools::ToolManager;

use crate::compact::CompactionStrategy;
use crate::context::ContextManager;
use crate::queue::MessageQueue;

/// One turn's worth of state.  Constructed by the session runtime, consumed
/// by `run`.
pub(crate) struct TurnExecutor {
    pub session_id: String,
    pub ctx: Arc<tokio::sync::Mutex<ContextManager>>,
    pub provider: Arc<dyn ProviderAdapter>,
    pub tools: Arc<ToolManager>,
    pub bus: EventBus,
    pub queue: Arc<MessageQueue>,
    pub compaction: Arc<dyn CompactionStrategy>,
    pub settings: Arc<ValidatedSettings>,
    pub model: ModelInfo,
    pub cancel: CancellationToken,
    /// Intersection of globally and session-enabled tool ids; `None` means
    /// everything registered.
    pub enabled_tools: Option<HashSet<String>>,
}

enum StreamOutcome {
    /// Non-recoverable provider failure; message for `llm:error`.
    Fatal(String),
    Cancelled {
        partial_text: String,
    },
    Completed {
        text: String,
        reasoning: Option<String>,
        usage: TokenUsage,
        tool_calls: Vec<ToolCallRequest>,
        /// Calls that streamed deltas but never became dispatchable.
        malformed: Vec<MalformedToolCall>,
    },
}

impl TurnExecutor {
    /// Drive the turn to completion.  Infallible from the caller's view:
    /// all outcomes are events.
    pub async fn run(self) {
        let reason = match self.turn_loop().await {
            Ok(reason) => reason,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "turn failed on storage");
                self.emit(AgentEvent::LlmError {
                    error: e.to_string(),
                    recoverable: false,
                    context: Some("history storage".into()),
                })
                .await;
                RunCompleteReason::Error
            }
        };
        self.emit(AgentEvent::RunComplete { reason }).await;
    }

    async fn turn_loop(&self) -> Result<RunCompleteReason, StoreError> {
        let mut iterations: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunCompleteReason::Cancelled);
            }

            // Compaction only ever runs here, between iterations.
            self.maybe_compact().await?;
            self.drain_queue().await?;

            let request = self.build_request().await;
            self.emit(AgentEvent::LlmThinking {}).await;

            let outcome = self.stream_model_call(request).await;
            let (text, reasoning, usage, tool_calls, malformed) = match outcome {
                StreamOutcome::Fatal(message) => {
                    self.emit(AgentEvent::LlmError {
                        error: message,
                        recoverable: false,
                        context: Some("provider".into()),
                    })
                    .await;
                    return Ok(RunCompleteReason::Error);
                }
                StreamOutcome::Cancelled { partial_text } => {
                    if !partial_text.is_empty() {
                        // Commit what already streamed so the next turn sees it.
                        self.ctx
                            .lock()
                            .await
                            .add_assistant_message(
                                vec![ContentPart::text(partial_text)],
                                Vec::new(),
                                MessageMetadata::default(),
                            )
                            .await?;
                    }
                    return Ok(RunCompleteReason::Cancelled);
                }
                StreamOutcome::Completed { text, reasoning, usage, tool_calls, malformed } => {
                    (text, reasoning, usage, tool_calls, malformed)
                }
            };

            let hit_cap = !tool_calls.is_empty() && iterations + 1 >= self.settings.max_iterations;

            {
                let mut ctx = self.ctx.lock().await;
                let content = if text.is_empty() {
                    Vec::new()
                } else {
                    vec![ContentPart::text(text.clone())]
                };
                // When the cap pre-empts dispatch, the calls are not stored:
                // a stored call with no tool result would poison the next
                // request.
                let stored_calls = if hit_cap { Vec::new() } else { tool_calls.clone() };
                ctx.add_assistant_message(content, stored_calls, MessageMetadata::default())
                    .await?;
                ctx.record_usage(usage);
            }
            self.emit(AgentEvent::LlmResponse {
                content: text.clone(),
                reasoning,
                token_usage: Some(usage),
            })
            .await;

            for m in malformed {
                let call_id = if m.id.is_empty() {
                    format!("incomplete_{}", m.index)
                } else {
                    m.id
                };
                self.emit(AgentEvent::LlmToolResult {
                    tool_name: m.name.unwrap_or_else(|| "unknown".into()),
                    call_id,
                    success: false,
                    sanitized: json!({ "error": m.reason }),
                    raw_result: None,
                })
                .await;
            }

            if tool_calls.is_empty() {
                return Ok(RunCompleteReason::Ok);
            }

            iterations += 1;
            if hit_cap {
                let cap_text = format!(
                    "Stopping: this turn reached the maximum of {} iterations. \
                     The requested tool calls were not executed.",
                    self.settings.max_iterations
                );
                self.ctx
                    .lock()
                    .await
                    .add_assistant_message(
                        vec![ContentPart::text(cap_text.clone())],
                        Vec::new(),
                        MessageMetadata::default(),
                    )
                    .await?;
                self.emit(AgentEvent::LlmResponse {
                    content: cap_text,
                    reasoning: None,
                    token_usage: None,
                })
                .await;
                return Ok(RunCompleteReason::IterCap);
            }

            // Sequential dispatch: deterministic event and history order.
            let mut cancelled_mid_dispatch = false;
            for call in &tool_calls {
                if self.cancel.is_cancelled() || cancelled_mid_dispatch {
                    cancelled_mid_dispatch = true;
                    // Every stored call still gets its result message so the
                    // conversation stays well-formed.
                    self.finish_tool_call(call, Err("cancelled before execution".into())).await?;
                    continue;
                }
                let execution = self
                    .tools
                    .execute_tool(
                        &call.name,
                        call.args.clone(),
                        &call.call_id,
                        Some(&self.session_id),
                        self.cancel.child_token(),
                    )
                    .await;
                match execution {
                    Ok(exec) => self.finish_tool_call(call, Ok(exec.result)).await?,
                    Err(e) => self.finish_tool_call(call, Err(e.to_string())).await?,
                }
            }
            if cancelled_mid_dispatch {
                return Ok(RunCompleteReason::Cancelled);
            }
        }
    }

    /// Emit `llm:tool-result` and append the tool message for one call.
    async fn finish_tool_call(
        &self,
        call: &ToolCallRequest,
        outcome: Result<serde_json::Value, String>,
    ) -> Result<(), StoreError> {
        match outcome {
            Ok(result) => {
                self.emit(AgentEvent::LlmToolResult {
                    tool_name: call.name.clone(),
                    call_id: call.call_id.clone(),
                    success: true,
                    sanitized: result.clone(),
                    raw_result: Some(result.clone()),
                })
                .await;
                self.ctx
                    .lock()
                    .await
                    .add_tool_result(&call.call_id, &call.name, &result, true)
                    .await
            }
            Err(message) => {
                self.emit(AgentEvent::LlmToolResult {
                    tool_name: call.name.clone(),
                    call_id: call.call_id.clone(),
                    success: false,
                    sanitized: json!({ "error": message }),
                    raw_result: None,
                })
                .await;
                self.ctx
                    .lock()
                    .await
                    .add_tool_result(&call.call_id, &call.name, &json!(message), false)
                    .await
            }
        }
    }

    async fn drain_queue(&self) -> Result<(), StoreError> {
        for msg in self.queue.drain() {
            self.emit(AgentEvent::MessageDequeued { id: msg.id.clone() }).await;
            self.ctx.lock().await.add_user_message(msg.content).await?;
        }
        Ok(())
    }

    async fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .list_tools()
            .await
            .iter()
            .filter(|d| {
                self.enabled_tools
                    .as_ref()
                    .is_none_or(|enabled| enabled.contains(&d.id))
            })
            .map(|d| ToolSchema {
                name: d.id.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            })
            .collect()
    }

    async fn build_request(&self) -> CompletionRequest {
        let tools = self.tool_schemas().await;
        let messages = self.ctx.lock().await.prepare_history().await;
        CompletionRequest {
            system_prompt: self.settings.system_prompt.clone(),
            messages,
            tools,
        }
    }

    async fn maybe_compact(&self) -> Result<(), StoreError> {
        let threshold = self
            .compaction
            .threshold_percent()
            .unwrap_or(self.settings.threshold_percent);
        if threshold >= 1.0 {
            return Ok(());
        }
        let schemas = self.tool_schemas().await;
        let system_prompt = self.settings.system_prompt.as_deref();
        let (estimate, filtered) = {
            let ctx = self.ctx.lock().await;
            (ctx.context_token_estimate(system_prompt, &schemas), ctx.filter_compacted())
        };
        let limit = (self.model.context_window as f32 * threshold) as usize;
        if estimate.estimated <= limit {
            return Ok(());
        }

        self.emit(AgentEvent::ContextCompacting { estimated_tokens: estimate.estimated }).await;
        let summaries = match self.compaction.compact(&filtered, &self.model).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "compaction failed; continuing uncompacted");
                return Ok(());
            }
        };
        if summaries.is_empty() {
            return Ok(());
        }

        let after = {
            let mut ctx = self.ctx.lock().await;
            for summary in summaries {
                ctx.add_message(summary).await?;
            }
            // Actuals describe a history shape that no longer exists.
            ctx.reset_actual_token_tracking();
            ctx.context_token_estimate(system_prompt, &schemas)
        };
        self.emit(AgentEvent::ContextCompacted {
            original_tokens: estimate.estimated,
            compacted_tokens: after.estimated,
            original_messages: filtered.len(),
            compacted_messages: after.filtered_message_count,
            strategy: self.compaction.name().to_string(),
            reason: CompactionReason::Threshold,
        })
        .await;
        Ok(())
    }

    async fn stream_model_call(&self, request: CompletionRequest) -> StreamOutcome {
        let mut stream = match self.provider.stream(request, self.cancel.child_token()).await {
            Ok(s) => s,
            Err(e) => return StreamOutcome::Fatal(format!("model call failed: {e}")),
        };

        let mut text = String::new();
        let mut response_text = String::new();
        let mut reasoning = None;
        let mut usage = TokenUsage::default();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        let mut assembler = ToolCallAssembler::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return StreamOutcome::Cancelled { partial_text: text };
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event {
                Err(e) => return StreamOutcome::Fatal(e.to_string()),
                Ok(ProviderEvent::Chunk { text: delta }) => {
                    text.push_str(&delta);
                    self.emit(AgentEvent::LlmChunk { content: delta }).await;
                }
                Ok(ProviderEvent::ToolCallPartial { index, id, name, args_delta }) => {
                    assembler.absorb(index, id.as_deref(), name.as_deref(), &args_delta);
                    self.emit(AgentEvent::LlmToolCallPartial { index, id, name, args_delta })
                        .await;
                }
                Ok(ProviderEvent::ToolCallFinal { id, name, args }) => {
                    self.emit(AgentEvent::LlmToolCall {
                        tool_name: name.clone(),
                        args: args.clone(),
                        call_id: id.clone(),
                    })
                    .await;
                    tool_calls.push(ToolCallRequest { call_id: id, name, args });
                }
                Ok(ProviderEvent::Response { content, reasoning: r, usage: u }) => {
                    response_text = content
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    reasoning = r;
                    usage = u;
                    break;
                }
                Ok(ProviderEvent::Error { recoverable: true, message }) => {
                    self.emit(AgentEvent::LlmError {
                        error: message,
                        recoverable: true,
                        context: Some("provider".into()),
                    })
                    .await;
                }
                Ok(ProviderEvent::Error { recoverable: false, message }) => {
                    return StreamOutcome::Fatal(message);
                }
            }
        }

        if text.is_empty() {
            text = response_text;
        }
        // Reconcile the delta-assembled view against the finals the adapter
        // emitted.  A call the assembler completed but the adapter never
        // finalized is recovered; one that could not complete is surfaced
        // with its parse failure.  An entry matching an emitted final (by
        // id, or by name + args when the partials carried no id) is the
        // normal duplicate path and is dropped.
        let (assembled, mut malformed) = assembler.finish();
        for call in assembled {
            let duplicate = tool_calls.iter().any(|t| {
                t.call_id == call.call_id || (t.name == call.name && t.args == call.args)
            });
            if duplicate {
                continue;
            }
            self.emit(AgentEvent::LlmToolCall {
                tool_name: call.name.clone(),
                args: call.args.clone(),
                call_id: call.call_id.clone(),
            })
            .await;
            tool_calls.push(call);
        }
        malformed.retain(|m| m.id.is_empty() || !tool_calls.iter().any(|t| t.call_id == m.id));
        StreamOutcome::Completed { text, reasoning, usage, tool_calls, malformed }
    }

    async fn emit(&self, event: AgentEvent) {
        self.bus
            .emit(EventEnvelope::session(self.session_id.clone(), event))
            .await;
    }
}
