// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::types::{ContentPart, InternalMessage, TokenUsage, ToolCallRequest};

/// A tool schema advertised to the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Request sent to a provider adapter.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<InternalMessage>,
    pub tools: Vec<ToolSchema>,
}

/// One streamed event from a provider adapter.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Text delta.
    Chunk { text: String },
    /// Incremental function-call assembly, keyed by the provider's parallel
    /// tool-call index.
    ToolCallPartial {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        args_delta: String,
    },
    /// A fully-assembled tool call: non-empty name, parseable arguments.
    ToolCallFinal {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// End of one model call.
    Response {
        content: Vec<ContentPart>,
        reasoning: Option<String>,
        usage: TokenUsage,
    },
    /// Provider-reported error.  Recoverable errors do not end the turn.
    Error { recoverable: bool, message: String },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// Uniform streaming interface over language-model providers.
///
/// Implementations own all wire formatting.  On cancellation they must
/// terminate the upstream request and stop yielding events; the stream
/// simply ends.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name for status display and registry lookup.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and the registry.
    fn model_name(&self) -> &str;

    async fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ProviderStream>;
}

// ─── Tool-call delta assembly ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Coalesces [`ProviderEvent::ToolCallPartial`] deltas into complete calls.
///
/// Providers interleave deltas for parallel tool calls by index; ids and
/// names may arrive on any delta.  A call is only final once its name is
/// non-empty and its accumulated arguments parse as JSON.  Calls that never
/// reach that state are reported separately so the turn loop can surface a
/// parse failure instead of corrupting history.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one delta.
    pub fn absorb(&mut self, index: u32, id: Option<&str>, name: Option<&str>, args_delta: &str) {
        let slot = self.pending.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            slot.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            slot.name = name.to_string();
        }
        slot.args_buf.push_str(args_delta);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush accumulated calls in index order.
    ///
    /// Returns `(complete, malformed)`.  Empty argument buffers resolve to
    /// `{}`; a missing id gets a synthetic one so the conversation can still
    /// be completed.  A call with no name, or arguments that do not parse,
    /// lands in `malformed` with the reason.
    pub fn finish(self) -> (Vec<ToolCallRequest>, Vec<MalformedToolCall>) {
        let mut complete = Vec::new();
        let mut malformed = Vec::new();
        for (index, slot) in self.pending {
            if slot.name.is_empty() {
                warn!(index, call_id = %slot.id, "tool call from model has no name; cannot dispatch");
                malformed.push(MalformedToolCall {
                    index,
                    id: slot.id,
                    name: None,
                    reason: "missing function name".into(),
                });
                continue;
            }
            let args = if slot.args_buf.is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str(&slot.args_buf) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            index,
                            tool_name = %slot.name,
                            error = %e,
                            "tool call arguments from model are not valid JSON"
                        );
                        malformed.push(MalformedToolCall {
                            index,
                            id: slot.id,
                            name: Some(slot.name),
                            reason: format!("invalid JSON arguments: {e}"),
                        });
                        continue;
                    }
                }
            };
            let call_id = if slot.id.is_empty() {
                let synthetic = format!("call_synthetic_{index}");
                warn!(
                    tool_name = %slot.name,
                    call_id = %synthetic,
                    "tool call from model had empty id; generated synthetic id"
                );
                synthetic
            } else {
                slot.id
            };
            complete.push(ToolCallRequest { call_id, name: slot.name, args });
        }
        (complete, malformed)
    }
}

/// A tool call that streamed deltas but never became dispatchable.
#[derive(Debug, Clone)]
pub struct MalformedToolCall {
    pub index: u32,
    pub id: String,
    pub name: Option<String>,
    pub reason: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
