// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::provider::{CompletionRequest, ProviderAdapter, ProviderEvent, ProviderStream};
use crate::types::{ContentPart, Role, TokenUsage};

/// Deterministic mock adapter for tests.  Echoes the last user message back
/// as the response.
#[derive(Default)]
pub struct MockAdapter;

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ProviderStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.joined_text())
            .unwrap_or_else(|| "[no input]".into());
        let text = format!("MOCK: {reply}");
        let events: Vec<anyhow::Result<ProviderEvent>> = vec![
            Ok(ProviderEvent::Chunk { text: text.clone() }),
            Ok(ProviderEvent::Response {
                content: vec![ContentPart::text(text)],
                reasoning: None,
                usage: TokenUsage::new(10, 10),
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted adapter.  Each `stream` call pops the next event script
/// from the front of the queue, so tests can specify exact sequences —
/// including tool calls and errors — without network access.
pub struct ScriptedAdapter {
    scripts: Mutex<Vec<Vec<ProviderEvent>>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedAdapter {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence emitted for that call.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![Self::text_script(&r)])
    }

    /// Convenience: a tool call on the first round, then a text reply.
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_call_script(call_id, tool_name, args),
            Self::text_script(&final_text.into()),
        ])
    }

    /// Event script for a plain text reply.
    pub fn text_script(text: &str) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::Chunk { text: text.to_string() },
            ProviderEvent::Response {
                content: vec![ContentPart::text(text)],
                reasoning: None,
                usage: TokenUsage::new(5, 5),
            },
        ]
    }

    /// Event script for a single tool call with no text.
    pub fn tool_call_script(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::ToolCallFinal {
                id: call_id.into(),
                name: tool_name.into(),
                args,
            },
            ProviderEvent::Response {
                content: Vec::new(),
                reasoning: None,
                usage: TokenUsage::new(5, 5),
            },
        ]
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ProviderStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback once all scripts are consumed.
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::types::InternalMessage;

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![InternalMessage::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockAdapter;
        let mut stream = p.stream(req("hi"), CancellationToken::new()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            ProviderEvent::Chunk { text } => assert!(text.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_response() {
        let p = MockAdapter;
        let mut stream = p.stream(req("hi"), CancellationToken::new()).await.unwrap();
        let mut last = None;
        while let Some(ev) = stream.next().await {
            last = Some(ev.unwrap());
        }
        assert!(matches!(last, Some(ProviderEvent::Response { .. })));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedAdapter::new(vec![
            ScriptedAdapter::text_script("one"),
            ScriptedAdapter::text_script("two"),
        ]);
        for expected in ["one", "two"] {
            let mut s = p.stream(req("x"), CancellationToken::new()).await.unwrap();
            let ev = s.next().await.unwrap().unwrap();
            assert!(matches!(ev, ProviderEvent::Chunk { text } if text == expected));
        }
    }

    #[tokio::test]
    async fn scripted_captures_last_request() {
        let p = ScriptedAdapter::always_text("ok");
        let _ = p.stream(req("captured"), CancellationToken::new()).await.unwrap();
        let seen = p.last_request.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().messages[0].as_text(), Some("captured"));
    }

    #[tokio::test]
    async fn scripted_falls_back_when_exhausted() {
        let p = ScriptedAdapter::new(vec![]);
        let mut s = p.stream(req("x"), CancellationToken::new()).await.unwrap();
        let ev = s.next().await.unwrap().unwrap();
        assert!(matches!(ev, ProviderEvent::Chunk { text } if text.contains("no more scripts")));
    }

    #[tokio::test]
    async fn tool_then_text_emits_tool_call_first_round() {
        let p = ScriptedAdapter::tool_then_text("c1", "internal--echo", serde_json::json!({}), "done");
        let mut s = p.stream(req("x"), CancellationToken::new()).await.unwrap();
        let mut saw_call = false;
        while let Some(ev) = s.next().await {
            if matches!(ev.unwrap(), ProviderEvent::ToolCallFinal { ref name, .. } if name == "internal--echo") {
                saw_call = true;
            }
        }
        assert!(saw_call);
    }
}
