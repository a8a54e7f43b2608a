// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The multi-session runtime: a registry of per-session state driving one
//! [`TurnExecutor`](crate::executor::TurnExecutor) per busy session.
//!
//! Each session owns its queue, cancel token, busy flag, and context
//! manager.  At most one turn runs per session; callers hitting a busy
//! session queue messages instead of starting a second stream.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tern_config::ValidatedSettings;
use tern_events::{AgentEvent, CompactionReason, EventBus, EventEnvelope, EventStream};
use tern_model::{
    ContentPart, ModelInfo, ProviderAdapter, QueuedMessage, TokenUsage, ToolCallRequest,
    ToolSchema,
};
use tern_store::{BlobStore, HistoryProvider, StoreError};
use tern_tools::{BackgroundNotifier, ToolManager};

use crate::compact::CompactionStrategy;
use crate::context::{CalculationBasis, ContextBreakdown, ContextManager};
use crate::executor::TurnExecutor;
use crate::queue::{MessageQueue, QueueError};

/// Errors surfaced synchronously from runtime operations.  Everything that
/// happens *inside* a turn is stream data, not an error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("session `{0}` already has a turn in flight")]
    SessionBusy(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session `{0}` is idle; start a turn instead of queueing")]
    SessionIdle(String),
    #[error("message queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves `@<name>` mentions in user input to content parts.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Option<Vec<ContentPart>>;
}

/// Receipt for a queued message.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReceipt {
    pub id: String,
    pub position: usize,
}

/// Collected result of a full turn.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: TokenUsage,
    pub tool_calls: Vec<ToolCallRequest>,
    pub session_id: String,
}

/// Context usage snapshot for one session.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub estimated_tokens: usize,
    pub actual_tokens: Option<u32>,
    /// Window minus the model's output reservation.
    pub max_context_tokens: u32,
    pub model_context_window: u32,
    pub threshold_percent: f32,
    pub usage_percent: f32,
    pub message_count: usize,
    pub filtered_message_count: usize,
    pub pruned_tool_count: usize,
    pub has_summary: bool,
    pub model: String,
    pub breakdown: ContextBreakdown,
    pub calculation_basis: CalculationBasis,
}

/// Result of an explicit compaction request.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    pub compacted_context_tokens: usize,
    pub original_messages: usize,
    pub compacted_messages: usize,
}

struct SessionHandle {
    id: String,
    queue: Arc<MessageQueue>,
    ctx: Arc<tokio::sync::Mutex<ContextManager>>,
    busy: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    title: Mutex<Option<String>>,
    enabled_tools: Mutex<Option<HashSet<String>>>,
}

/// The per-process registry of session runtimes.
pub struct AgentRuntime {
    settings: Arc<ValidatedSettings>,
    bus: EventBus,
    provider: Arc<dyn ProviderAdapter>,
    tools: Arc<ToolManager>,
    history: Arc<dyn HistoryProvider>,
    blobs: Arc<dyn BlobStore>,
    compaction: Arc<dyn CompactionStrategy>,
    model: ModelInfo,
    resources: Mutex<Option<Arc<dyn ResourceResolver>>>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl AgentRuntime {
    /// Assemble a runtime from already-validated settings and its
    /// collaborators.  There is no separate start phase: the returned value
    /// is ready to serve.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ValidatedSettings,
        bus: EventBus,
        provider: Arc<dyn ProviderAdapter>,
        tools: Arc<ToolManager>,
        history: Arc<dyn HistoryProvider>,
        blobs: Arc<dyn BlobStore>,
        compaction: Arc<dyn CompactionStrategy>,
        registry: &tern_model::ModelRegistry,
    ) -> Arc<Self> {
        let model = registry.lookup_or_default(&settings.model.provider, &settings.model.name);
        let runtime = Arc::new(Self {
            settings: Arc::new(settings),
            bus,
            provider,
            tools,
            history,
            blobs,
            compaction,
            model,
            resources: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        });
        // Background completions route back through the session queues.
        runtime
            .tools
            .set_notifier(Arc::new(QueueNotifier { runtime: Arc::downgrade(&runtime) }));
        runtime
    }

    pub fn set_resource_resolver(&self, resolver: Arc<dyn ResourceResolver>) {
        *self.resources.lock().expect("resources poisoned") = Some(resolver);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Turn entry points ─────────────────────────────────────────────────────

    /// Start a turn and return the session-filtered event stream, which ends
    /// after `run:complete`.
    pub async fn stream(
        &self,
        session_id: &str,
        content: Vec<ContentPart>,
    ) -> Result<TurnStream, RuntimeError> {
        validate_content(&content)?;
        let handle = self.get_or_create_session(session_id).await?;
        if handle.busy.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::SessionBusy(session_id.to_string()));
        }
        match self.start_turn(&handle, content).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                *handle.cancel.lock().expect("cancel slot poisoned") = None;
                handle.busy.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_turn(
        &self,
        handle: &Arc<SessionHandle>,
        content: Vec<ContentPart>,
    ) -> Result<TurnStream, RuntimeError> {
        let cancel = CancellationToken::new();
        *handle.cancel.lock().expect("cancel slot poisoned") = Some(cancel.clone());

        let content = self.expand_resources(content).await;
        self.maybe_auto_title(handle, &content).await;

        // Subscribe before spawning so the consumer misses nothing.
        let stream = TurnStream::new(self.bus.session_stream(&handle.id));

        // Validation and storage failures here precede the first model call
        // and propagate to the caller.
        handle.ctx.lock().await.add_user_message(content).await?;

        let executor = TurnExecutor {
            session_id: handle.id.clone(),
            ctx: handle.ctx.clone(),
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            bus: self.bus.clone(),
            queue: handle.queue.clone(),
            compaction: self.compaction.clone(),
            settings: self.settings.clone(),
            model: self.model.clone(),
            cancel: cancel.clone(),
            enabled_tools: self.effective_enabled_tools(handle),
        };
        let handle = handle.clone();
        let tools = self.tools.clone();
        tokio::spawn(async move {
            executor.run().await;
            // Skill-scoped approvals do not survive the run.
            tools.clear_session_approvals(&handle.id);
            *handle.cancel.lock().expect("cancel slot poisoned") = None;
            handle.busy.store(false, Ordering::SeqCst);
        });
        Ok(stream)
    }

    /// Run a turn to completion and collect its result.
    pub async fn generate(
        &self,
        session_id: &str,
        content: Vec<ContentPart>,
    ) -> Result<GenerateResponse, RuntimeError> {
        use futures::StreamExt;
        let mut stream = self.stream(session_id, content).await?;
        let mut response = GenerateResponse {
            content: String::new(),
            reasoning: None,
            usage: TokenUsage::default(),
            tool_calls: Vec::new(),
            session_id: session_id.to_string(),
        };
        let mut fatal: Option<String> = None;
        while let Some(env) = stream.next().await {
            match env.event {
                AgentEvent::LlmResponse { content, reasoning, token_usage } => {
                    response.content = content;
                    if reasoning.is_some() {
                        response.reasoning = reasoning;
                    }
                    if let Some(u) = token_usage {
                        response.usage.accumulate(&u);
                    }
                }
                AgentEvent::LlmToolCall { tool_name, args, call_id } => {
                    response.tool_calls.push(ToolCallRequest {
                        call_id,
                        name: tool_name,
                        args,
                    });
                }
                AgentEvent::LlmError { error, recoverable: false, .. } => {
                    fatal = Some(error);
                }
                _ => {}
            }
        }
        match fatal {
            Some(error) => Err(RuntimeError::Provider(error)),
            None => Ok(response),
        }
    }

    // ── Cancellation & status ─────────────────────────────────────────────────

    /// Cancel the session's active turn.  Returns whether one was running;
    /// cancelling an idle or unknown session is a no-op.
    pub fn cancel(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().expect("session map poisoned");
        let Some(handle) = sessions.get(session_id) else {
            return false;
        };
        if !handle.busy.load(Ordering::SeqCst) {
            return false;
        }
        let cancelled = match handle.cancel.lock().expect("cancel slot poisoned").as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        cancelled
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(session_id)
            .is_some_and(|h| h.busy.load(Ordering::SeqCst))
    }

    // ── Message queue ─────────────────────────────────────────────────────────

    /// Queue a message for delivery at the busy session's next iteration.
    pub async fn queue_message(
        &self,
        session_id: &str,
        content: Vec<ContentPart>,
    ) -> Result<QueueReceipt, RuntimeError> {
        validate_content(&content)?;
        let handle = self.existing_session(session_id)?;
        if !handle.busy.load(Ordering::SeqCst) {
            return Err(RuntimeError::SessionIdle(session_id.to_string()));
        }
        let (msg, position) = handle.queue.enqueue(content).map_err(|e| match e {
            QueueError::Full { capacity } => RuntimeError::QueueFull { capacity },
        })?;
        self.bus
            .emit(EventEnvelope::session(
                session_id,
                AgentEvent::MessageQueued { id: msg.id.clone(), position },
            ))
            .await;
        Ok(QueueReceipt { id: msg.id, position })
    }

    pub fn get_queued_messages(&self, session_id: &str) -> Result<Vec<QueuedMessage>, RuntimeError> {
        Ok(self.existing_session(session_id)?.queue.list())
    }

    pub fn remove_queued_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<bool, RuntimeError> {
        Ok(self.existing_session(session_id)?.queue.remove(message_id))
    }

    pub fn clear_message_queue(&self, session_id: &str) -> Result<usize, RuntimeError> {
        Ok(self.existing_session(session_id)?.queue.clear())
    }

    // ── Context operations ────────────────────────────────────────────────────

    /// Full stored history for one session.
    pub async fn get_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<tern_model::InternalMessage>, RuntimeError> {
        let handle = self.existing_session(session_id)?;
        let ctx = handle.ctx.lock().await;
        Ok(ctx.get_history().to_vec())
    }

    pub async fn get_context_stats(&self, session_id: &str) -> Result<ContextStats, RuntimeError> {
        let handle = self.existing_session(session_id)?;
        let schemas = self.enabled_tool_schemas(&handle).await;
        let ctx = handle.ctx.lock().await;
        let est = ctx.context_token_estimate(self.settings.system_prompt.as_deref(), &schemas);
        let window = self.model.context_window;
        Ok(ContextStats {
            estimated_tokens: est.estimated,
            actual_tokens: est.actual.map(|u| u.total),
            max_context_tokens: window.saturating_sub(self.model.max_output_tokens),
            model_context_window: window,
            threshold_percent: self
                .compaction
                .threshold_percent()
                .unwrap_or(self.settings.threshold_percent),
            usage_percent: if window == 0 {
                0.0
            } else {
                est.estimated as f32 / window as f32 * 100.0
            },
            message_count: est.message_count,
            filtered_message_count: est.filtered_message_count,
            pruned_tool_count: est.pruned_tool_count,
            has_summary: est.has_summary,
            model: format!("{}/{}", self.model.provider, self.model.name),
            breakdown: est.breakdown,
            calculation_basis: est.calculation_basis,
        })
    }

    /// Run the compaction strategy now, regardless of threshold.  `None`
    /// when the strategy declined (nothing worth summarising).
    pub async fn compact_context(
        &self,
        session_id: &str,
    ) -> Result<Option<CompactionOutcome>, RuntimeError> {
        let handle = self.existing_session(session_id)?;
        let schemas = self.enabled_tool_schemas(&handle).await;
        let system_prompt = self.settings.system_prompt.as_deref();
        let (filtered, before) = {
            let ctx = handle.ctx.lock().await;
            (ctx.filter_compacted(), ctx.context_token_estimate(system_prompt, &schemas))
        };
        let summaries = self
            .compaction
            .compact(&filtered, &self.model)
            .await
            .map_err(|e| RuntimeError::Provider(e.to_string()))?;
        if summaries.is_empty() {
            return Ok(None);
        }
        self.bus
            .emit(EventEnvelope::session(
                session_id,
                AgentEvent::ContextCompacting { estimated_tokens: before.estimated },
            ))
            .await;
        let after = {
            let mut ctx = handle.ctx.lock().await;
            for summary in summaries {
                ctx.add_message(summary).await?;
            }
            ctx.reset_actual_token_tracking();
            ctx.context_token_estimate(system_prompt, &schemas)
        };
        self.bus
            .emit(EventEnvelope::session(
                session_id,
                AgentEvent::ContextCompacted {
                    original_tokens: before.estimated,
                    compacted_tokens: after.estimated,
                    original_messages: filtered.len(),
                    compacted_messages: after.filtered_message_count,
                    strategy: self.compaction.name().to_string(),
                    reason: CompactionReason::Manual,
                },
            ))
            .await;
        Ok(Some(CompactionOutcome {
            compacted_context_tokens: after.estimated,
            original_messages: filtered.len(),
            compacted_messages: after.filtered_message_count,
        }))
    }

    /// Append a context-clear marker; stored history is untouched.
    pub async fn clear_context(&self, session_id: &str) -> Result<(), RuntimeError> {
        let handle = self.existing_session(session_id)?;
        handle.ctx.lock().await.clear_context().await?;
        self.bus
            .emit(EventEnvelope::session(session_id, AgentEvent::ContextCleared {}))
            .await;
        Ok(())
    }

    /// Drop the session's history, queue, and title.
    pub async fn reset_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        let handle = self.existing_session(session_id)?;
        if handle.busy.load(Ordering::SeqCst) {
            return Err(RuntimeError::SessionBusy(session_id.to_string()));
        }
        handle.ctx.lock().await.reset().await?;
        handle.queue.clear();
        *handle.title.lock().expect("title poisoned") = None;
        self.bus
            .emit(EventEnvelope::session(session_id, AgentEvent::SessionReset {}))
            .await;
        Ok(())
    }

    // ── Titles & tool enablement ──────────────────────────────────────────────

    pub async fn set_title(&self, session_id: &str, title: impl Into<String>) -> Result<(), RuntimeError> {
        let handle = self.existing_session(session_id)?;
        let title = title.into();
        *handle.title.lock().expect("title poisoned") = Some(title.clone());
        self.bus
            .emit(EventEnvelope::session(session_id, AgentEvent::SessionTitleUpdated { title }))
            .await;
        Ok(())
    }

    pub fn title(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(session_id)
            .and_then(|h| h.title.lock().expect("title poisoned").clone())
    }

    /// Narrow (never widen) the tool set for one session.
    pub fn set_session_enabled_tools(
        &self,
        session_id: &str,
        tools: Option<Vec<String>>,
    ) -> Result<(), RuntimeError> {
        let handle = self.existing_session(session_id)?;
        *handle.enabled_tools.lock().expect("enabled tools poisoned") =
            tools.map(|v| v.into_iter().collect());
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn get_or_create_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<SessionHandle>, RuntimeError> {
        if let Some(h) = self
            .sessions
            .lock()
            .expect("session map poisoned")
            .get(session_id)
            .cloned()
        {
            return Ok(h);
        }
        let ctx = ContextManager::hydrate(
            session_id,
            self.history.clone(),
            self.blobs.clone(),
            self.bus.clone(),
            self.model.clone(),
            self.settings.keep_recent_tool_results,
        )
        .await?;
        let handle = Arc::new(SessionHandle {
            id: session_id.to_string(),
            queue: Arc::new(MessageQueue::new(self.settings.max_queued_messages)),
            ctx: Arc::new(tokio::sync::Mutex::new(ctx)),
            busy: AtomicBool::new(false),
            cancel: Mutex::new(None),
            title: Mutex::new(None),
            enabled_tools: Mutex::new(None),
        });
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        Ok(sessions.entry(session_id.to_string()).or_insert(handle).clone())
    }

    fn existing_session(&self, session_id: &str) -> Result<Arc<SessionHandle>, RuntimeError> {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownSession(session_id.to_string()))
    }

    fn effective_enabled_tools(&self, handle: &SessionHandle) -> Option<HashSet<String>> {
        let global: Option<HashSet<String>> = self
            .settings
            .enabled_tools
            .as_ref()
            .map(|v| v.iter().cloned().collect());
        let session = handle.enabled_tools.lock().expect("enabled tools poisoned").clone();
        match (global, session) {
            (None, None) => None,
            (Some(g), None) => Some(g),
            (None, Some(s)) => Some(s),
            (Some(g), Some(s)) => Some(g.intersection(&s).cloned().collect()),
        }
    }

    async fn enabled_tool_schemas(&self, handle: &SessionHandle) -> Vec<ToolSchema> {
        let enabled = self.effective_enabled_tools(handle);
        self.tools
            .list_tools()
            .await
            .iter()
            .filter(|d| enabled.as_ref().is_none_or(|set| set.contains(&d.id)))
            .map(|d| ToolSchema {
                name: d.id.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            })
            .collect()
    }

    /// Resolve `@<name>` mentions through the resource resolver.  The
    /// original text always stays; resolved resources are appended after
    /// the part that mentioned them.
    async fn expand_resources(&self, content: Vec<ContentPart>) -> Vec<ContentPart> {
        let resolver = self.resources.lock().expect("resources poisoned").clone();
        let Some(resolver) = resolver else {
            return content;
        };
        let re = Regex::new(r"@([A-Za-z][A-Za-z0-9_.-]*)").expect("valid mention regex");
        let mut out = Vec::with_capacity(content.len());
        for part in content {
            let mentions: Vec<String> = match &part {
                ContentPart::Text { text } => re
                    .captures_iter(text)
                    .map(|c| c[1].to_string())
                    // `@blob:<id>` is storage indirection, not a resource.
                    .filter(|name| name != "blob")
                    .collect(),
                _ => Vec::new(),
            };
            out.push(part);
            for name in mentions {
                match resolver.resolve(&name).await {
                    Some(parts) => out.extend(parts),
                    None => debug!(resource = %name, "resource mention did not resolve; keeping text"),
                }
            }
        }
        out
    }

    async fn maybe_auto_title(&self, handle: &Arc<SessionHandle>, content: &[ContentPart]) {
        {
            let title = handle.title.lock().expect("title poisoned");
            if title.is_some() {
                return;
            }
        }
        if !handle.ctx.lock().await.get_history().is_empty() {
            return;
        }
        let Some(text) = content.iter().find_map(|p| match p {
            ContentPart::Text { text } if !text.trim().is_empty() => Some(text),
            _ => None,
        }) else {
            return;
        };
        let title = derive_title(text);
        *handle.title.lock().expect("title poisoned") = Some(title.clone());
        self.bus
            .emit(EventEnvelope::session(
                handle.id.clone(),
                AgentEvent::SessionTitleUpdated { title },
            ))
            .await;
    }
}

/// First words of the first user message, capped for display.
fn derive_title(text: &str) -> String {
    let mut title = String::new();
    for word in text.split_whitespace() {
        if !title.is_empty() {
            if title.len() + word.len() + 1 > 48 {
                break;
            }
            title.push(' ');
        }
        title.push_str(word);
        if title.len() >= 48 {
            break;
        }
    }
    title
}

fn validate_content(content: &[ContentPart]) -> Result<(), RuntimeError> {
    let has_substance = content.iter().any(|p| match p {
        ContentPart::Text { text } => !text.trim().is_empty(),
        _ => true,
    });
    if content.is_empty() || !has_substance {
        return Err(RuntimeError::Validation("content must not be empty".into()));
    }
    Ok(())
}

/// Delivers background-task completion notes into the owning session's
/// queue when a turn is live; otherwise the note is only logged and the
/// result stays in the task registry.
struct QueueNotifier {
    runtime: Weak<AgentRuntime>,
}

impl BackgroundNotifier for QueueNotifier {
    fn notify(&self, session_id: &str, note: String) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        let sessions = runtime.sessions.lock().expect("session map poisoned");
        let Some(handle) = sessions.get(session_id) else {
            info!(session_id, note = %note, "background completion for unknown session");
            return;
        };
        if !handle.busy.load(Ordering::SeqCst) {
            info!(session_id, note = %note, "background completion while session idle");
            return;
        }
        match handle.queue.enqueue(vec![ContentPart::text(note)]) {
            Ok((msg, position)) => {
                let bus = runtime.bus.clone();
                let session = session_id.to_string();
                let id = msg.id;
                tokio::spawn(async move {
                    bus.emit(EventEnvelope::session(
                        session,
                        AgentEvent::MessageQueued { id, position },
                    ))
                    .await;
                });
            }
            Err(e) => warn!(session_id, error = %e, "could not queue background completion note"),
        }
    }
}

/// A caller's view of one turn: the session-filtered bus stream, fused
/// after `run:complete`.
#[derive(Debug)]
pub struct TurnStream {
    inner: EventStream,
    done: bool,
}

impl TurnStream {
    fn new(inner: EventStream) -> Self {
        Self { inner, done: false }
    }
}

impl Stream for TurnStream {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(env)) => {
                if matches!(env.event, AgentEvent::RunComplete { .. }) {
                    self.done = true;
                }
                Poll::Ready(Some(env))
            }
            other => other,
        }
    }
}

impl TurnStream {
    /// Collect every event until the stream closes.
    pub async fn collect_events(mut self) -> Vec<EventEnvelope> {
        use futures::StreamExt;
        let mut events = Vec::new();
        while let Some(env) = self.next().await {
            events.push(env);
        }
        events
    }
}
