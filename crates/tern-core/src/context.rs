// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The model-facing view of one session's history and its token economy.
//!
//! The manager owns an in-memory projection of the append log.  Storage is
//! append-only; summary filtering, capability filtering, tool-output
//! pruning, and blob expansion are all read-time transforms applied when a
//! request is built.

use std::sync::Arc;

use base64::Engine;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use tern_events::{AgentEvent, EventBus, EventEnvelope};
use tern_model::{
    blob_ref_id, estimate_text_tokens, ContentPart, InternalMessage, MessageMetadata, ModelInfo,
    Role, TokenUsage, ToolCallRequest, ToolSchema,
};
use tern_store::{BlobStore, HistoryProvider, StoreError};

const PRUNED_TOOL_RESULT: &str =
    "[old tool result pruned to conserve context; re-run the tool if this output is needed]";

/// How the current estimate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationBasis {
    /// Anchored on provider-reported token counts from the last model call.
    Actuals,
    /// Pure chars/4 estimation.
    Estimate,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ContextBreakdown {
    pub system_prompt: usize,
    pub tools: usize,
    pub messages: usize,
}

/// Snapshot of the session's context economy.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEstimate {
    pub estimated: usize,
    pub actual: Option<TokenUsage>,
    pub breakdown: ContextBreakdown,
    pub message_count: usize,
    pub filtered_message_count: usize,
    pub pruned_tool_count: usize,
    pub has_summary: bool,
    pub calculation_basis: CalculationBasis,
}

pub struct ContextManager {
    session_id: String,
    history: Arc<dyn HistoryProvider>,
    blobs: Arc<dyn BlobStore>,
    bus: EventBus,
    model: ModelInfo,
    keep_recent_tool_results: usize,
    messages: Vec<InternalMessage>,
    /// Usage from the most recent model call, and the projection length at
    /// that moment (messages beyond it are "new" and estimated).
    last_usage: Option<TokenUsage>,
    last_usage_at: Option<usize>,
}

impl ContextManager {
    /// Build the manager, loading any existing history for the session.
    pub async fn hydrate(
        session_id: impl Into<String>,
        history: Arc<dyn HistoryProvider>,
        blobs: Arc<dyn BlobStore>,
        bus: EventBus,
        model: ModelInfo,
        keep_recent_tool_results: usize,
    ) -> Result<Self, StoreError> {
        let session_id = session_id.into();
        let messages = history.read(&session_id).await?;
        Ok(Self {
            session_id,
            history,
            blobs,
            bus,
            model,
            keep_recent_tool_results,
            messages,
            last_usage: None,
            last_usage_at: None,
        })
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    // ── Appends ───────────────────────────────────────────────────────────────

    pub async fn add_message(&mut self, msg: InternalMessage) -> Result<(), StoreError> {
        self.history.append(&self.session_id, &msg).await?;
        self.messages.push(msg);
        Ok(())
    }

    pub async fn add_user_message(&mut self, parts: Vec<ContentPart>) -> Result<(), StoreError> {
        self.add_message(InternalMessage::user_with_parts(parts)).await
    }

    pub async fn add_assistant_message(
        &mut self,
        content: Vec<ContentPart>,
        tool_calls: Vec<ToolCallRequest>,
        metadata: MessageMetadata,
    ) -> Result<(), StoreError> {
        self.add_message(InternalMessage::assistant_with_calls(content, tool_calls, metadata))
            .await
    }

    /// Append a tool message for `call_id`.  Failures are stored like
    /// successes: the model reasons about them in-band.
    pub async fn add_tool_result(
        &mut self,
        call_id: &str,
        tool_name: &str,
        result: &serde_json::Value,
        success: bool,
    ) -> Result<(), StoreError> {
        let text = match result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let text = if success { text } else { format!("Error: {text}") };
        self.add_message(InternalMessage::tool_result(call_id, tool_name, text)).await
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    /// Full stored history (projection of the append log).
    pub fn get_history(&self) -> &[InternalMessage] {
        &self.messages
    }

    /// Hide everything the newest summary replaced:
    /// `[summary, preserved.., post-summary..]` where `preserved` is the
    /// tail the summary's `original_message_count` did not cover.
    ///
    /// Summaries count the messages of the *view they were appended to*, so
    /// folding the log forward composes across repeated compactions: an
    /// older summary disappears once a newer one covers it.
    pub fn filter_compacted(&self) -> Vec<InternalMessage> {
        let mut view: Vec<InternalMessage> = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            if msg.is_summary() {
                let covered = msg
                    .metadata
                    .original_message_count
                    .unwrap_or(view.len())
                    .min(view.len());
                let preserved = view.split_off(covered);
                view.clear();
                view.push(msg.clone());
                view.extend(preserved);
            } else {
                view.push(msg.clone());
            }
        }
        view
    }

    /// The request-ready history: summary filtering, capability filtering,
    /// tool-output pruning, blob expansion.  Idempotent — running it twice
    /// yields the same messages.
    pub async fn prepare_history(&mut self) -> Vec<InternalMessage> {
        self.prune_old_tool_results();
        let filtered = self.filter_compacted();
        let mut out = Vec::with_capacity(filtered.len());
        for msg in filtered {
            let msg = self.apply_capability_filter(msg).await;
            let msg = self.expand_blob_refs(msg).await;
            out.push(msg);
        }
        out
    }

    /// Replace the content of tool messages older than the most recent
    /// `keep_recent_tool_results`, keeping their structural place.
    fn prune_old_tool_results(&mut self) {
        let tool_indices: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool)
            .map(|(i, _)| i)
            .collect();
        let prune_until = tool_indices.len().saturating_sub(self.keep_recent_tool_results);
        for &i in &tool_indices[..prune_until] {
            let msg = &mut self.messages[i];
            if msg.metadata.compacted_at.is_some() {
                continue;
            }
            msg.content = vec![ContentPart::text(PRUNED_TOOL_RESULT)];
            msg.metadata.compacted_at = Some(chrono::Utc::now());
            debug!(session_id = %self.session_id, index = i, "pruned old tool result");
        }
    }

    /// Drop content parts the active model is known not to support.  On an
    /// unknown verdict the part is retained and logged.  A user message that
    /// would empty out gets a single placeholder instead.
    async fn apply_capability_filter(&self, mut msg: InternalMessage) -> InternalMessage {
        if msg.role != Role::User {
            return msg;
        }
        let mut kept = Vec::with_capacity(msg.content.len());
        let mut dropped_mimes = Vec::new();
        for part in msg.content {
            match self.model.supports_part(&part) {
                Some(true) => kept.push(part),
                Some(false) => dropped_mimes.push(part.mime().to_string()),
                None => {
                    warn!(
                        session_id = %self.session_id,
                        model = %self.model.name,
                        mime = part.mime(),
                        "capability unknown; retaining content part"
                    );
                    kept.push(part);
                }
            }
        }
        for mime in &dropped_mimes {
            self.bus
                .emit(EventEnvelope::session(
                    self.session_id.clone(),
                    AgentEvent::LlmUnsupportedInput {
                        mime: mime.clone(),
                        reason: format!("model {} does not accept this input", self.model.name),
                    },
                ))
                .await;
        }
        if kept.is_empty() {
            kept.push(ContentPart::text(format!(
                "[unsupported content removed: model {} cannot process {}]",
                self.model.name,
                dropped_mimes.join(", ")
            )));
        }
        msg.content = kept;
        msg
    }

    /// Inline `@blob:<id>` references.  Text references split into
    /// pre/part/post segments; binary parts resolve to inline base64.
    /// Resolution failures keep the original reference and log.
    async fn expand_blob_refs(&self, mut msg: InternalMessage) -> InternalMessage {
        let mut out = Vec::with_capacity(msg.content.len());
        for part in msg.content {
            match part {
                ContentPart::Text { text } if text.contains(tern_model::BLOB_REF_PREFIX) => {
                    self.expand_text_refs(&text, &mut out).await;
                }
                ContentPart::Image { data, mime } => match blob_ref_id(&data) {
                    Some(id) => match self.blobs.read(id).await {
                        Ok(blob) => out.push(ContentPart::image(blob.as_base64(), mime)),
                        Err(e) => {
                            warn!(blob_id = id, error = %e, "blob expansion failed; keeping reference");
                            out.push(ContentPart::Image { data, mime });
                        }
                    },
                    None => out.push(ContentPart::Image { data, mime }),
                },
                ContentPart::File { data, mime, filename } => match blob_ref_id(&data) {
                    Some(id) => match self.blobs.read(id).await {
                        Ok(blob) => out.push(ContentPart::File {
                            data: blob.as_base64(),
                            mime,
                            filename: filename.or(blob.metadata.original_name),
                        }),
                        Err(e) => {
                            warn!(blob_id = id, error = %e, "blob expansion failed; keeping reference");
                            out.push(ContentPart::File { data, mime, filename });
                        }
                    },
                    None => out.push(ContentPart::File { data, mime, filename }),
                },
                other => out.push(other),
            }
        }
        msg.content = out;
        msg
    }

    async fn expand_text_refs(&self, text: &str, out: &mut Vec<ContentPart>) {
        // Compilation cannot fail for a fixed pattern; keep it local so the
        // manager has no lazy-static machinery.
        let re = Regex::new(r"@blob:([A-Za-z0-9_-]+)").expect("valid blob regex");
        let mut buffer = String::new();
        let mut cursor = 0;
        for caps in re.captures_iter(text) {
            let whole = caps.get(0).expect("match 0 always present");
            let id = &caps[1];
            buffer.push_str(&text[cursor..whole.start()]);
            cursor = whole.end();
            match self.blobs.read(id).await {
                Ok(blob) => {
                    if !buffer.trim().is_empty() {
                        out.push(ContentPart::text(std::mem::take(&mut buffer)));
                    } else {
                        buffer.clear();
                    }
                    let mime = blob.metadata.mime.clone();
                    if mime.starts_with("image/") {
                        out.push(ContentPart::image(blob.as_base64(), mime));
                    } else if mime.starts_with("text/") {
                        let text = String::from_utf8_lossy(&blob.bytes).into_owned();
                        out.push(ContentPart::text(text));
                    } else {
                        out.push(ContentPart::File {
                            data: blob.as_base64(),
                            mime,
                            filename: blob.metadata.original_name.clone(),
                        });
                    }
                }
                Err(e) => {
                    warn!(blob_id = id, error = %e, "blob expansion failed; keeping reference");
                    buffer.push_str(whole.as_str());
                }
            }
        }
        buffer.push_str(&text[cursor..]);
        if !buffer.is_empty() {
            out.push(ContentPart::text(buffer));
        }
    }

    // ── Token accounting ──────────────────────────────────────────────────────

    /// The number the usage display and the compaction trigger consult.
    pub fn context_token_estimate(
        &self,
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> ContextEstimate {
        let filtered = self.filter_compacted();
        let system_tokens = system_prompt.map(|s| estimate_text_tokens(s.len())).unwrap_or(0);
        let tool_tokens: usize = tools
            .iter()
            .map(|t| {
                estimate_text_tokens(
                    t.name.len() + t.description.len() + t.parameters.to_string().len(),
                )
            })
            .sum();
        let message_tokens: usize = filtered.iter().map(InternalMessage::approx_tokens).sum();

        let (estimated, basis) = match (self.last_usage, self.last_usage_at) {
            (Some(usage), Some(at)) => {
                let new_tokens: usize = self.messages[at.min(self.messages.len())..]
                    .iter()
                    .map(InternalMessage::approx_tokens)
                    .sum();
                (
                    usage.input as usize + usage.output as usize + new_tokens,
                    CalculationBasis::Actuals,
                )
            }
            _ => (system_tokens + tool_tokens + message_tokens, CalculationBasis::Estimate),
        };

        ContextEstimate {
            estimated,
            actual: self.last_usage,
            breakdown: ContextBreakdown {
                system_prompt: system_tokens,
                tools: tool_tokens,
                messages: message_tokens,
            },
            message_count: self.messages.len(),
            filtered_message_count: filtered.len(),
            pruned_tool_count: self
                .messages
                .iter()
                .filter(|m| m.metadata.compacted_at.is_some())
                .count(),
            has_summary: self.messages.iter().any(InternalMessage::is_summary),
            calculation_basis: basis,
        }
    }

    /// Record provider-reported usage for the call that just finished and
    /// attach it to the newest assistant message.
    pub fn record_usage(&mut self, usage: TokenUsage) {
        if let Some(m) = self.messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
            m.metadata.token_usage = Some(usage);
        }
        self.last_usage = Some(usage);
        self.last_usage_at = Some(self.messages.len());
    }

    /// Forget actuals.  Mandatory after compaction: the delta formula would
    /// anchor on a history shape that no longer exists.
    pub fn reset_actual_token_tracking(&mut self) {
        self.last_usage = None;
        self.last_usage_at = None;
    }

    /// Append an empty summary marker: history before it leaves the model
    /// context but stays in storage.
    pub async fn clear_context(&mut self) -> Result<(), StoreError> {
        let marker = InternalMessage {
            role: Role::Assistant,
            content: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            metadata: MessageMetadata {
                is_summary: true,
                original_message_count: Some(self.filter_compacted().len()),
                ..Default::default()
            },
        };
        self.add_message(marker).await?;
        self.reset_actual_token_tracking();
        Ok(())
    }

    /// Drop the projection and stored history for this session.
    pub async fn reset(&mut self) -> Result<(), StoreError> {
        self.history.clear(&self.session_id).await?;
        self.messages.clear();
        self.reset_actual_token_tracking();
        Ok(())
    }
}

pub(crate) fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
