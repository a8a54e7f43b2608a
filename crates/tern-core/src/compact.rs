// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Compaction strategies: turn a prefix of history into a summary message.
//!
//! A strategy only decides *what* replaces the prefix; the executor owns
//! when compaction runs and the context manager owns how the summary hides
//! older messages at read time.  Returning an empty list makes the pass a
//! no-op.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tern_config::SummaryStyle;
use tern_model::{
    CompletionRequest, InternalMessage, MessageMetadata, ModelInfo, ProviderAdapter,
    ProviderEvent, Role,
};

const NARRATIVE_PROMPT: &str =
    "Summarise the conversation below into a dense replacement for the original \
     history. Keep every technical detail, decision, file name, identifier, and \
     tool output that later turns may depend on. Write plain prose; do not \
     address the user.";

const STRUCTURED_PROMPT: &str = "\
Produce a state checkpoint of the conversation below using EXACTLY these
Markdown sections, information-dense, with identifiers and error messages
preserved verbatim:

## Active Task
## Key Decisions
## Files & Artifacts
## Constraints
## Pending Items
## Narrative";

const DROPPED_NOTICE: &str =
    "[Earlier history was dropped to keep the conversation within the context \
     window. Ask the user to restate anything that is missing.]";

/// Decides which prefix of history to replace and with what.
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    /// Strategy label used in `context:compacted` events.
    fn name(&self) -> &'static str;

    /// Trigger threshold this strategy wants, overriding the configured
    /// `threshold_percent`.  `None` defers to configuration (whose default
    /// of 1.0 disables automatic compaction).
    fn threshold_percent(&self) -> Option<f32> {
        None
    }

    /// Produce summary messages for a prefix of `history`, or `[]` to skip.
    async fn compact(
        &self,
        history: &[InternalMessage],
        model: &ModelInfo,
    ) -> anyhow::Result<Vec<InternalMessage>>;
}

/// Never compacts.
pub struct NoopCompaction;

#[async_trait]
impl CompactionStrategy for NoopCompaction {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn compact(
        &self,
        _history: &[InternalMessage],
        _model: &ModelInfo,
    ) -> anyhow::Result<Vec<InternalMessage>> {
        Ok(Vec::new())
    }
}

/// Deterministic fallback: replace the prefix with a canned notice.  Always
/// succeeds and never calls a model, so it also serves as the recovery path
/// when a summarisation call fails.
pub struct KeepRecentCompaction {
    pub keep_recent: usize,
}

#[async_trait]
impl CompactionStrategy for KeepRecentCompaction {
    fn name(&self) -> &'static str {
        "keep-recent"
    }

    async fn compact(
        &self,
        history: &[InternalMessage],
        _model: &ModelInfo,
    ) -> anyhow::Result<Vec<InternalMessage>> {
        let split = choose_split(history, self.keep_recent);
        if split == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![summary_message(DROPPED_NOTICE.to_string(), split)])
    }
}

/// Model-driven summarisation of the old prefix.
///
/// On provider failure or an empty summary, falls back to the deterministic
/// dropped-prefix notice rather than failing the turn.
pub struct LlmCompaction {
    provider: Arc<dyn ProviderAdapter>,
    style: SummaryStyle,
    keep_recent: usize,
}

impl LlmCompaction {
    pub fn new(provider: Arc<dyn ProviderAdapter>, style: SummaryStyle, keep_recent: usize) -> Self {
        Self { provider, style, keep_recent }
    }

    async fn summarise(&self, prefix: &[InternalMessage]) -> anyhow::Result<String> {
        let prompt = match self.style {
            SummaryStyle::Narrative => NARRATIVE_PROMPT,
            SummaryStyle::Structured => STRUCTURED_PROMPT,
        };
        let request = CompletionRequest {
            system_prompt: None,
            messages: vec![InternalMessage::user(format!(
                "{prompt}\n\n---\n\n{}",
                serialize_history(prefix)
            ))],
            tools: Vec::new(),
        };
        let mut stream = self.provider.stream(request, CancellationToken::new()).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                ProviderEvent::Chunk { text: t } => text.push_str(&t),
                ProviderEvent::Response { content, .. } => {
                    if text.is_empty() {
                        text = content
                            .iter()
                            .filter_map(|p| match p {
                                tern_model::ContentPart::Text { text } => Some(text.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                    }
                    break;
                }
                ProviderEvent::Error { recoverable: false, message } => {
                    anyhow::bail!("summary call failed: {message}");
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl CompactionStrategy for LlmCompaction {
    fn name(&self) -> &'static str {
        match self.style {
            SummaryStyle::Narrative => "narrative",
            SummaryStyle::Structured => "structured",
        }
    }

    async fn compact(
        &self,
        history: &[InternalMessage],
        _model: &ModelInfo,
    ) -> anyhow::Result<Vec<InternalMessage>> {
        let split = choose_split(history, self.keep_recent);
        if split == 0 {
            return Ok(Vec::new());
        }
        match self.summarise(&history[..split]).await {
            Ok(text) if !text.trim().is_empty() => Ok(vec![summary_message(text, split)]),
            Ok(_) => {
                warn!("summary came back empty; dropping prefix instead");
                Ok(vec![summary_message(DROPPED_NOTICE.to_string(), split)])
            }
            Err(e) => {
                warn!(error = %e, "summary call failed; dropping prefix instead");
                Ok(vec![summary_message(DROPPED_NOTICE.to_string(), split)])
            }
        }
    }
}

/// Pick how many leading messages to summarise, preserving a recent tail.
///
/// The split backs up past tool messages so a preserved tail never starts
/// with a tool result whose call was summarised away — providers reject
/// such orphans on the next request.
pub fn choose_split(history: &[InternalMessage], keep_recent: usize) -> usize {
    // Too short to be worth splitting: summarising most of a small history
    // costs more than it frees.
    if history.len() <= keep_recent.saturating_mul(2) {
        return 0;
    }
    let mut split = history.len() - keep_recent;
    while split > 0 && history[split].role == Role::Tool {
        split -= 1;
    }
    split
}

fn summary_message(text: String, original_count: usize) -> InternalMessage {
    InternalMessage {
        role: Role::Assistant,
        content: vec![tern_model::ContentPart::text(text)],
        tool_calls: Vec::new(),
        tool_call_id: None,
        tool_name: None,
        metadata: MessageMetadata {
            is_summary: true,
            original_message_count: Some(original_count),
            compacted_at: Some(chrono::Utc::now()),
            ..Default::default()
        },
    }
}

/// Flatten history into the text block fed to the summariser.
fn serialize_history(messages: &[InternalMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(&format!("[{role}] {}\n", m.joined_text()));
        for tc in &m.tool_calls {
            out.push_str(&format!("[{role}] called {}({})\n", tc.name, tc.args));
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
