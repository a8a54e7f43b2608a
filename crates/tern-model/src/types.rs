// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Blob references ──────────────────────────────────────────────────────────

/// String prefix marking an indirection into the blob store.
pub const BLOB_REF_PREFIX: &str = "@blob:";

/// Return the blob id when `s` is a blob reference (`@blob:<id>`).
pub fn blob_ref_id(s: &str) -> Option<&str> {
    s.strip_prefix(BLOB_REF_PREFIX).filter(|id| !id.is_empty())
}

/// Build the reference string for a blob id.
pub fn blob_ref(id: &str) -> String {
    format!("{BLOB_REF_PREFIX}{id}")
}

// ─── Content parts ────────────────────────────────────────────────────────────

/// A single content part in a message.
///
/// Binary parts carry either inline base64 in `data` or a blob reference
/// (`@blob:<id>`), never both meanings at once.  References keep large
/// payloads out of the model context until expansion resolves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// Base64 payload or `@blob:<id>`.
        data: String,
        mime: String,
    },
    File {
        /// Base64 payload or `@blob:<id>`.
        data: String,
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    UiResource {
        uri: String,
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime: impl Into<String>) -> Self {
        Self::Image { data: data.into(), mime: mime.into() }
    }

    pub fn file(
        data: impl Into<String>,
        mime: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        Self::File { data: data.into(), mime: mime.into(), filename }
    }

    /// MIME type of a binary part; text parts report `text/plain`.
    pub fn mime(&self) -> &str {
        match self {
            Self::Text { .. } => "text/plain",
            Self::Image { mime, .. } | Self::File { mime, .. } | Self::UiResource { mime, .. } => {
                mime
            }
        }
    }

    /// `true` when this part's payload is a blob reference rather than
    /// inline bytes.
    pub fn is_blob_ref(&self) -> bool {
        match self {
            Self::Text { .. } => false,
            Self::Image { data, .. } | Self::File { data, .. } => blob_ref_id(data).is_some(),
            Self::UiResource { blob, .. } => {
                blob.as_deref().and_then(blob_ref_id).is_some()
            }
        }
    }

    /// Context-cost estimate for this part.
    ///
    /// Text counts chars/4 rounded up; binary parts cost a flat 1000 —
    /// provider-reported actuals dominate after the first call, so the
    /// fixed figure only has to be a sane placeholder.
    pub fn approx_tokens(&self) -> usize {
        match self {
            Self::Text { text } => estimate_text_tokens(text.len()),
            Self::Image { .. } | Self::File { .. } => 1000,
            Self::UiResource { content, .. } => match content {
                Some(text) => estimate_text_tokens(text.len()),
                None => 1000,
            },
        }
    }
}

/// chars/4, rounded up.
pub fn estimate_text_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

// ─── Token usage ──────────────────────────────────────────────────────────────

/// Token usage reported by the provider for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<u32>,
}

impl TokenUsage {
    pub fn new(input: u32, output: u32) -> Self {
        Self { input, output, total: input + output, reasoning: None }
    }

    /// Fold another call's usage into this turn-level accumulator.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
        if let Some(r) = other.reasoning {
            *self.reasoning.get_or_insert(0) += r;
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: serde_json::Value,
}

/// Bookkeeping attached to a stored message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// This message is a compaction summary; history before it is hidden
    /// from the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
    /// Summary written at session close rather than mid-conversation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_session_summary: bool,
    /// How many messages the summary replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_count: Option<usize>,
    /// Set when a tool message's content has been pruned from the model
    /// view; the message keeps its structural place in history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<DateTime<Utc>>,
    /// Provider-reported usage for the call that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl MessageMetadata {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A single message in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalMessage {
    pub role: Role,
    /// May be empty for assistant messages that only carry tool calls.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Assistant messages only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Tool messages only: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_default")]
    pub metadata: MessageMetadata,
}

impl InternalMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: parts,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    /// Assistant message carrying text (possibly empty) and tool calls.
    pub fn assistant_with_calls(
        content: Vec<ContentPart>,
        tool_calls: Vec<ToolCallRequest>,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            metadata,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            metadata: MessageMetadata::default(),
        }
    }

    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            metadata: MessageMetadata::default(),
        }
    }

    /// The message's text when it consists of exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match self.content.as_slice() {
            [ContentPart::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// Concatenation of all text parts.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// `true` for a current-summary candidate (either summary flavour).
    pub fn is_summary(&self) -> bool {
        self.metadata.is_summary || self.metadata.is_session_summary
    }

    /// Approximate context cost of this message.  Never less than 1.
    pub fn approx_tokens(&self) -> usize {
        let content: usize = self.content.iter().map(ContentPart::approx_tokens).sum();
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| estimate_text_tokens(c.name.len() + c.args.to_string().len()))
            .sum();
        (content + calls).max(1)
    }
}

// ─── Queued messages ──────────────────────────────────────────────────────────

/// A user message waiting for delivery into a busy session's next iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: Vec<ContentPart>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(content: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            enqueued_at: Utc::now(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Blob references ───────────────────────────────────────────────────────

    #[test]
    fn blob_ref_round_trips() {
        let r = blob_ref("abc123");
        assert_eq!(r, "@blob:abc123");
        assert_eq!(blob_ref_id(&r), Some("abc123"));
    }

    #[test]
    fn blob_ref_id_rejects_plain_text() {
        assert_eq!(blob_ref_id("hello"), None);
        assert_eq!(blob_ref_id("@blob:"), None);
    }

    #[test]
    fn image_part_detects_blob_ref() {
        let p = ContentPart::image("@blob:xyz", "image/png");
        assert!(p.is_blob_ref());
        let inline = ContentPart::image("aGVsbG8=", "image/png");
        assert!(!inline.is_blob_ref());
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn text_tokens_round_up() {
        assert_eq!(estimate_text_tokens(8), 2);
        assert_eq!(estimate_text_tokens(9), 3);
        assert_eq!(estimate_text_tokens(0), 0);
    }

    #[test]
    fn image_part_costs_fixed_thousand() {
        assert_eq!(ContentPart::image("AAAA", "image/png").approx_tokens(), 1000);
    }

    #[test]
    fn file_part_costs_fixed_thousand() {
        assert_eq!(ContentPart::file("AAAA", "application/pdf", None).approx_tokens(), 1000);
    }

    #[test]
    fn message_tokens_include_tool_calls() {
        let m = InternalMessage::assistant_with_calls(
            Vec::new(),
            vec![ToolCallRequest {
                call_id: "c1".into(),
                name: "aaaa".into(), // 4 chars
                args: serde_json::json!({}), // "{}" → 2 chars
            }],
            MessageMetadata::default(),
        );
        // (4 + 2) chars → 2 tokens
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn empty_message_costs_at_least_one() {
        let m = InternalMessage::assistant_with_calls(
            Vec::new(),
            Vec::new(),
            MessageMetadata::default(),
        );
        assert_eq!(m.approx_tokens(), 1);
    }

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_message_has_role_and_text() {
        let m = InternalMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn tool_result_carries_call_linkage() {
        let m = InternalMessage::tool_result("c9", "internal--echo", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("c9"));
        assert_eq!(m.tool_name.as_deref(), Some("internal--echo"));
    }

    #[test]
    fn as_text_none_for_multipart() {
        let m = InternalMessage::user_with_parts(vec![
            ContentPart::text("a"),
            ContentPart::image("AA", "image/png"),
        ]);
        assert!(m.as_text().is_none());
        assert_eq!(m.joined_text(), "a");
    }

    #[test]
    fn summary_flag_covers_both_flavours() {
        let mut m = InternalMessage::assistant("sum");
        assert!(!m.is_summary());
        m.metadata.is_session_summary = true;
        assert!(m.is_summary());
    }

    // ── Usage accumulation ────────────────────────────────────────────────────

    #[test]
    fn usage_accumulates_across_calls() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage::new(10, 5));
        total.accumulate(&TokenUsage::new(7, 3));
        assert_eq!(total.input, 17);
        assert_eq!(total.output, 8);
        assert_eq!(total.total, 25);
        assert_eq!(total.reasoning, None);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let m = InternalMessage::user("payload");
        let json = serde_json::to_string(&m).unwrap();
        let back: InternalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn default_metadata_is_omitted_from_json() {
        let json = serde_json::to_string(&InternalMessage::user("x")).unwrap();
        assert!(!json.contains("metadata"), "default metadata serialized: {json}");
    }

    #[test]
    fn content_part_tags_are_snake_case() {
        let json = serde_json::to_string(&ContentPart::image("AA", "image/png")).unwrap();
        assert!(json.contains("\"type\":\"image\""));
        let json =
            serde_json::to_string(&ContentPart::UiResource {
                uri: "ui://x".into(),
                mime: "text/html".into(),
                content: None,
                blob: None,
            })
            .unwrap();
        assert!(json.contains("\"type\":\"ui_resource\""));
    }
}
