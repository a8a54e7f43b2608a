// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::Value;

use tern_model::TokenUsage;

use crate::approval::{ApprovalStatus, ApprovalType};

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCompleteReason {
    Ok,
    Cancelled,
    Error,
    IterCap,
}

/// What triggered a compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    Threshold,
    Manual,
}

/// Every event the turn loop and its collaborators can emit.
///
/// The serde names are wire-stable: consumers key on them and they never
/// change shape without a new name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentEvent {
    #[serde(rename = "llm:thinking")]
    LlmThinking {},
    #[serde(rename = "llm:chunk")]
    LlmChunk { content: String },
    #[serde(rename = "llm:tool-call-partial")]
    LlmToolCallPartial {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        args_delta: String,
    },
    #[serde(rename = "llm:tool-call")]
    LlmToolCall {
        tool_name: String,
        args: Value,
        call_id: String,
    },
    #[serde(rename = "llm:response")]
    LlmResponse {
        content: String,
        reasoning: Option<String>,
        token_usage: Option<TokenUsage>,
    },
    #[serde(rename = "llm:tool-result")]
    LlmToolResult {
        tool_name: String,
        call_id: String,
        success: bool,
        /// Payload safe to show consumers (errors stringified, oversized
        /// content elided).
        sanitized: Value,
        raw_result: Option<Value>,
    },
    #[serde(rename = "llm:error")]
    LlmError {
        error: String,
        recoverable: bool,
        context: Option<String>,
    },
    #[serde(rename = "llm:unsupported-input")]
    LlmUnsupportedInput { mime: String, reason: String },
    #[serde(rename = "tool:running")]
    ToolRunning {
        tool_name: String,
        tool_call_id: String,
    },
    #[serde(rename = "tool:background")]
    ToolBackground {
        tool_name: String,
        tool_call_id: String,
        description: String,
        timeout_ms: Option<u64>,
        notify_on_complete: bool,
    },
    #[serde(rename = "approval:request")]
    ApprovalRequested {
        approval_id: String,
        approval_type: ApprovalType,
        metadata: Value,
    },
    #[serde(rename = "approval:response")]
    ApprovalResolved {
        approval_id: String,
        status: ApprovalStatus,
        reason: Option<String>,
        data: Option<Value>,
    },
    #[serde(rename = "message:queued")]
    MessageQueued { id: String, position: usize },
    #[serde(rename = "message:dequeued")]
    MessageDequeued { id: String },
    #[serde(rename = "context:compacting")]
    ContextCompacting { estimated_tokens: usize },
    #[serde(rename = "context:compacted")]
    ContextCompacted {
        original_tokens: usize,
        compacted_tokens: usize,
        original_messages: usize,
        compacted_messages: usize,
        strategy: String,
        reason: CompactionReason,
    },
    #[serde(rename = "session:title-updated")]
    SessionTitleUpdated { title: String },
    #[serde(rename = "session:reset")]
    SessionReset {},
    #[serde(rename = "context:cleared")]
    ContextCleared {},
    #[serde(rename = "run:complete")]
    RunComplete { reason: RunCompleteReason },
}

impl AgentEvent {
    /// The wire-stable event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LlmThinking {} => "llm:thinking",
            Self::LlmChunk { .. } => "llm:chunk",
            Self::LlmToolCallPartial { .. } => "llm:tool-call-partial",
            Self::LlmToolCall { .. } => "llm:tool-call",
            Self::LlmResponse { .. } => "llm:response",
            Self::LlmToolResult { .. } => "llm:tool-result",
            Self::LlmError { .. } => "llm:error",
            Self::LlmUnsupportedInput { .. } => "llm:unsupported-input",
            Self::ToolRunning { .. } => "tool:running",
            Self::ToolBackground { .. } => "tool:background",
            Self::ApprovalRequested { .. } => "approval:request",
            Self::ApprovalResolved { .. } => "approval:response",
            Self::MessageQueued { .. } => "message:queued",
            Self::MessageDequeued { .. } => "message:dequeued",
            Self::ContextCompacting { .. } => "context:compacting",
            Self::ContextCompacted { .. } => "context:compacted",
            Self::SessionTitleUpdated { .. } => "session:title-updated",
            Self::SessionReset {} => "session:reset",
            Self::ContextCleared {} => "context:cleared",
            Self::RunComplete { .. } => "run:complete",
        }
    }
}

/// An event plus the session it belongs to (`None` for process-wide events).
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl EventEnvelope {
    pub fn session(session_id: impl Into<String>, event: AgentEvent) -> Self {
        Self { session_id: Some(session_id.into()), event }
    }

    pub fn global(event: AgentEvent) -> Self {
        Self { session_id: None, event }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_serde_tag() {
        let ev = AgentEvent::LlmChunk { content: "x".into() };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], ev.kind());
    }

    #[test]
    fn run_complete_reason_is_snake_case() {
        let ev = AgentEvent::RunComplete { reason: RunCompleteReason::IterCap };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["data"]["reason"], "iter_cap");
    }

    #[test]
    fn envelope_flattens_event() {
        let env = EventEnvelope::session("s1", AgentEvent::SessionReset {});
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["event"], "session:reset");
    }

    #[test]
    fn every_taxonomy_name_is_stable() {
        // A change here is a wire-format break, not a refactor.
        let cases = [
            AgentEvent::LlmThinking {}.kind(),
            AgentEvent::ContextCleared {}.kind(),
            AgentEvent::SessionReset {}.kind(),
        ];
        assert_eq!(cases, ["llm:thinking", "context:cleared", "session:reset"]);
    }
}
