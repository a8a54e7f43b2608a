// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Uniform tool registry and executor across sources.
//!
//! Local tools (internal/custom) execute in-process after schema
//! validation; MCP tools route to their provider.  Every execution passes
//! the layered approval flow first; denials, timeouts, and failures are
//! returned as errors the turn loop keeps in-band.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tern_config::{ApprovalMode, ToolPolicies};
use tern_events::{AgentEvent, ApprovalStatus, ApprovalType, EventBus, EventEnvelope};

use crate::approval::ApprovalManager;
use crate::background::{BackgroundNotifier, BackgroundTasks};
use crate::id::{matches_pattern, ToolId, ToolSource};
use crate::patterns::{derive_pattern_key, pattern_suggestions};
use crate::tool::{
    split_call_metadata, AllowedToolsProvider, ExecutionResult, Tool, ToolCallPlugin,
    ToolDescriptor, ToolError, ToolExecutionContext, ToolProvider,
};

enum Routed {
    Local(Arc<dyn Tool>),
    Provider(Arc<dyn ToolProvider>, String),
}

pub struct ToolManager {
    bus: EventBus,
    approvals: ApprovalManager,
    allowed: Arc<dyn AllowedToolsProvider>,
    approval_mode: ApprovalMode,
    background_enabled: bool,
    policies: Mutex<ToolPolicies>,
    local: Mutex<HashMap<String, Arc<dyn Tool>>>,
    providers: Mutex<Vec<Arc<dyn ToolProvider>>>,
    listing_cache: Mutex<Option<Arc<Vec<ToolDescriptor>>>>,
    plugins: Mutex<Vec<Arc<dyn ToolCallPlugin>>>,
    /// Skill-scoped allow patterns, cleared when the session's run ends.
    session_scoped: Mutex<HashMap<String, HashSet<String>>>,
    background: BackgroundTasks,
    notifier: Mutex<Option<Arc<dyn BackgroundNotifier>>>,
}

impl ToolManager {
    pub fn new(
        bus: EventBus,
        approvals: ApprovalManager,
        allowed: Arc<dyn AllowedToolsProvider>,
        approval_mode: ApprovalMode,
        policies: ToolPolicies,
        background_enabled: bool,
    ) -> Self {
        Self {
            bus,
            approvals,
            allowed,
            approval_mode,
            background_enabled,
            policies: Mutex::new(policies),
            local: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
            listing_cache: Mutex::new(None),
            plugins: Mutex::new(Vec::new()),
            session_scoped: Mutex::new(HashMap::new()),
            background: BackgroundTasks::new(),
            notifier: Mutex::new(None),
        }
    }

    pub fn approvals(&self) -> &ApprovalManager {
        &self.approvals
    }

    pub fn background_tasks(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn set_notifier(&self, notifier: Arc<dyn BackgroundNotifier>) {
        *self.notifier.lock().expect("notifier poisoned") = Some(notifier);
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register a locally-executable tool.  MCP-sourced ids go through
    /// providers instead.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let id = tool.id();
        if id.is_mcp() {
            return Err(ToolError::InvalidArgs(format!(
                "`{id}` is MCP-sourced; register its provider instead"
            )));
        }
        self.local
            .lock()
            .expect("local tools poisoned")
            .insert(id.to_string(), tool);
        self.invalidate_listing();
        Ok(())
    }

    pub fn add_provider(&self, provider: Arc<dyn ToolProvider>) {
        self.providers.lock().expect("providers poisoned").push(provider);
        self.invalidate_listing();
    }

    pub fn remove_provider(&self, server_name: &str) -> bool {
        let mut providers = self.providers.lock().expect("providers poisoned");
        let before = providers.len();
        providers.retain(|p| p.server_name() != server_name);
        let removed = providers.len() != before;
        drop(providers);
        if removed {
            self.invalidate_listing();
        }
        removed
    }

    pub fn add_plugin(&self, plugin: Arc<dyn ToolCallPlugin>) {
        self.plugins.lock().expect("plugins poisoned").push(plugin);
    }

    pub fn update_policies(&self, policies: ToolPolicies) {
        *self.policies.lock().expect("policies poisoned") = policies;
        self.invalidate_listing();
    }

    pub fn invalidate_listing(&self) {
        *self.listing_cache.lock().expect("listing cache poisoned") = None;
    }

    // ── Session-scoped approvals ──────────────────────────────────────────────

    pub fn add_session_auto_approve(&self, session_id: &str, pattern: impl Into<String>) {
        self.session_scoped
            .lock()
            .expect("session approvals poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(pattern.into());
    }

    /// Drop the skill-scoped allow list for a session (run completion).
    pub fn clear_session_approvals(&self, session_id: &str) {
        self.session_scoped
            .lock()
            .expect("session approvals poisoned")
            .remove(session_id);
    }

    // ── Listing ───────────────────────────────────────────────────────────────

    /// All known tools, cached until a provider or policy change.
    pub async fn list_tools(&self) -> Arc<Vec<ToolDescriptor>> {
        if let Some(cached) = self.listing_cache.lock().expect("listing cache poisoned").clone() {
            return cached;
        }
        let mut listing: Vec<ToolDescriptor> = {
            let local = self.local.lock().expect("local tools poisoned");
            local
                .values()
                .map(|t| ToolDescriptor {
                    id: t.id().to_string(),
                    description: t.description().to_string(),
                    input_schema: t.input_schema(),
                })
                .collect()
        };
        let providers: Vec<Arc<dyn ToolProvider>> =
            self.providers.lock().expect("providers poisoned").clone();
        for provider in providers {
            match provider.list_tools().await {
                Ok(tools) => {
                    let server = provider.server_name();
                    listing.extend(tools.into_iter().map(|t| ToolDescriptor {
                        id: ToolId::mcp(Some(server.to_string()), t.id).to_string(),
                        description: t.description,
                        input_schema: t.input_schema,
                    }));
                }
                Err(e) => {
                    warn!(server = provider.server_name(), error = %e, "tool listing failed; skipping provider");
                }
            }
        }
        listing.sort_by(|a, b| a.id.cmp(&b.id));
        let listing = Arc::new(listing);
        *self.listing_cache.lock().expect("listing cache poisoned") = Some(listing.clone());
        listing
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Run one tool call through approval, plugins, and routing.
    ///
    /// `cancel` is the turn's token: a cancelled token aborts the wait, not
    /// necessarily the underlying work.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: Value,
        call_id: &str,
        session_id: Option<&str>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ExecutionResult, ToolError> {
        let tool_id = ToolId::parse(name)?;
        let mut args = args;
        let meta = split_call_metadata(&mut args);

        let (require_approval, approval_status) = self
            .run_approval_flow(&tool_id, name, &args, call_id, session_id)
            .await?;

        self.bus
            .emit(EventEnvelope {
                session_id: session_id.map(String::from),
                event: AgentEvent::ToolRunning {
                    tool_name: name.to_string(),
                    tool_call_id: call_id.to_string(),
                },
            })
            .await;

        let ctx = ToolExecutionContext {
            session_id: session_id.map(String::from),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
        };

        let plugins: Vec<Arc<dyn ToolCallPlugin>> =
            self.plugins.lock().expect("plugins poisoned").clone();
        for plugin in &plugins {
            plugin.before_tool_call(name, &mut args, &ctx).await;
        }

        let routed = self.resolve(&tool_id, name).await?;

        if meta.run_in_background && self.background_enabled {
            let description = meta
                .call_description
                .clone()
                .unwrap_or_else(|| format!("{name} (background)"));
            let notifier = self.notifier.lock().expect("notifier poisoned").clone();
            let timeout_ms = meta.timeout_ms;
            let task_ctx = ctx.clone();
            let task_id = self.background.spawn(
                description.clone(),
                name.to_string(),
                session_id.map(String::from),
                notifier,
                async move { run_routed(routed, args, &task_ctx, timeout_ms).await },
            );
            self.bus
                .emit(EventEnvelope {
                    session_id: session_id.map(String::from),
                    event: AgentEvent::ToolBackground {
                        tool_name: name.to_string(),
                        tool_call_id: call_id.to_string(),
                        description: description.clone(),
                        timeout_ms: meta.timeout_ms,
                        notify_on_complete: meta.notify_on_complete,
                    },
                })
                .await;
            return Ok(ExecutionResult {
                result: json!({
                    "taskId": task_id,
                    "status": "running",
                    "description": description,
                }),
                require_approval,
                approval_status,
            });
        }

        let mut result = run_routed(routed, args, &ctx, meta.timeout_ms).await?;
        for plugin in &plugins {
            plugin.after_tool_result(name, &mut result, &ctx).await;
        }
        Ok(ExecutionResult { result, require_approval, approval_status })
    }

    async fn resolve(&self, tool_id: &ToolId, name: &str) -> Result<Routed, ToolError> {
        match &tool_id.source {
            ToolSource::Mcp { server } => {
                let providers: Vec<Arc<dyn ToolProvider>> =
                    self.providers.lock().expect("providers poisoned").clone();
                let provider = match server {
                    Some(s) => providers.into_iter().find(|p| p.server_name() == s),
                    // Serverless short form: resolve through the listing.
                    None => {
                        let mut found = None;
                        for p in providers {
                            let lists_it = p
                                .list_tools()
                                .await
                                .map(|ts| ts.iter().any(|t| t.id == tool_id.name))
                                .unwrap_or(false);
                            if lists_it {
                                found = Some(p);
                                break;
                            }
                        }
                        found
                    }
                };
                provider
                    .map(|p| Routed::Provider(p, tool_id.name.clone()))
                    .ok_or_else(|| ToolError::NotFound(name.to_string()))
            }
            _ => {
                let tool = self
                    .local
                    .lock()
                    .expect("local tools poisoned")
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
                Ok(Routed::Local(tool))
            }
        }
    }

    // ── Approval flow ─────────────────────────────────────────────────────────

    /// Layered approval.  First matching layer wins; `Ok` carries whether a
    /// rendezvous took place and with what outcome.
    async fn run_approval_flow(
        &self,
        tool_id: &ToolId,
        name: &str,
        args: &Value,
        call_id: &str,
        session_id: Option<&str>,
    ) -> Result<(bool, Option<ApprovalStatus>), ToolError> {
        let policies = self.policies.lock().expect("policies poisoned").clone();

        // 1. Static denial.
        if policies.always_deny.iter().any(|p| matches_pattern(name, p)) {
            return Err(ToolError::ExecutionDenied {
                reason: format!("tool `{name}` is denied by policy"),
            });
        }

        // 2. Tool-provided override (local tools only).
        let local_tool = self.local.lock().expect("local tools poisoned").get(name).cloned();
        if let Some(tool) = &local_tool {
            if let Some(ov) = tool.approval_override(args) {
                let resp = self
                    .approvals
                    .request_approval(ov.approval_type, session_id.map(String::from), ov.metadata)
                    .await;
                return match resp.status {
                    ApprovalStatus::Approved => Ok((true, Some(ApprovalStatus::Approved))),
                    ApprovalStatus::Denied => {
                        Err(ToolError::ExecutionDenied { reason: ov.denial_reason })
                    }
                    ApprovalStatus::Cancelled => Err(cancelled_to_error(&resp)),
                };
            }
        }

        // 3. Session skill-scoped allow list.
        if let Some(sid) = session_id {
            let scoped = self.session_scoped.lock().expect("session approvals poisoned");
            if scoped
                .get(sid)
                .is_some_and(|set| set.iter().any(|p| matches_pattern(name, p)))
            {
                return Ok((false, None));
            }
        }

        // 4. Static allow list.
        if policies.always_allow.iter().any(|p| matches_pattern(name, p)) {
            return Ok((false, None));
        }

        // 5. Remembered approvals.
        if self.allowed.is_allowed(name, session_id).await {
            return Ok((false, None));
        }

        // 6. Bash pattern set.
        let bash_command = if tool_id.is_bash() {
            args.get("command").and_then(Value::as_str)
        } else {
            None
        };
        let bash_key = bash_command.and_then(derive_pattern_key);
        if let (Some(sid), Some(key)) = (session_id, bash_key.as_deref()) {
            if self.approvals.matches_bash_pattern(sid, key) {
                debug!(tool = name, pattern = key, "allowed by bash pattern");
                return Ok((false, None));
            }
        }

        // 7. Approval mode.
        match self.approval_mode {
            ApprovalMode::AutoApprove => Ok((false, None)),
            ApprovalMode::AutoDeny => Err(ToolError::ExecutionDenied {
                reason: "approval mode is auto-deny".into(),
            }),
            ApprovalMode::Manual => {
                let preview = local_tool.as_ref().and_then(|t| t.generate_preview(args));
                let mut metadata = json!({
                    "toolName": name,
                    "callId": call_id,
                    "args": args,
                });
                if let Some(p) = preview {
                    metadata["preview"] = Value::String(p);
                }
                if let Some(key) = &bash_key {
                    metadata["bashPattern"] = Value::String(key.clone());
                }
                // Widening remember-choices, most specific first, so the
                // handler can offer them alongside the derived key.
                if let Some(cmd) = bash_command {
                    let suggestions = pattern_suggestions(cmd);
                    if !suggestions.is_empty() {
                        metadata["bashPatternSuggestions"] = json!(suggestions);
                    }
                }
                let resp = self
                    .approvals
                    .request_approval(
                        ApprovalType::ToolConfirmation,
                        session_id.map(String::from),
                        metadata,
                    )
                    .await;
                match resp.status {
                    ApprovalStatus::Approved => {
                        if resp.remember_choice() {
                            self.allowed.remember(name, session_id).await;
                            let tool_name = name.to_string();
                            self.approvals
                                .auto_approve_pending(|r| {
                                    r.metadata.get("toolName").and_then(Value::as_str)
                                        == Some(tool_name.as_str())
                                })
                                .await;
                        }
                        if resp.remember_pattern() {
                            if let (Some(sid), Some(key)) = (session_id, bash_key.as_deref()) {
                                self.approvals.add_bash_pattern(sid, key);
                                let key = key.to_string();
                                self.approvals
                                    .auto_approve_pending(|r| {
                                        r.metadata.get("bashPattern").and_then(Value::as_str)
                                            == Some(key.as_str())
                                    })
                                    .await;
                            }
                        }
                        Ok((true, Some(ApprovalStatus::Approved)))
                    }
                    ApprovalStatus::Denied => Err(ToolError::ExecutionDenied {
                        reason: resp
                            .reason
                            .unwrap_or_else(|| "denied by approval handler".into()),
                    }),
                    ApprovalStatus::Cancelled => Err(cancelled_to_error(&resp)),
                }
            }
        }
    }
}

/// Map a cancelled approval to the matching tool error: timeouts surface as
/// `execution_timeout`, everything else as a denial.
fn cancelled_to_error(resp: &tern_events::ApprovalResponse) -> ToolError {
    if resp.reason.as_deref() == Some("timeout") {
        let timeout_ms = resp
            .data
            .as_ref()
            .and_then(|d| d.get("timeoutMs"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        ToolError::ExecutionTimeout { timeout_ms }
    } else {
        ToolError::ExecutionDenied { reason: "approval cancelled".into() }
    }
}

async fn run_routed(
    routed: Routed,
    args: Value,
    ctx: &ToolExecutionContext,
    timeout_ms: Option<u64>,
) -> Result<Value, ToolError> {
    let fut = async {
        match routed {
            Routed::Local(tool) => {
                validate_args(&tool.input_schema(), &args)?;
                tool.execute(args, ctx).await
            }
            Routed::Provider(provider, bare_name) => {
                provider.execute(&bare_name, args, ctx.session_id.as_deref()).await
            }
        }
    };
    let bounded = async {
        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
                .await
                .map_err(|_| ToolError::ExecutionTimeout { timeout_ms: ms })?,
            None => fut.await,
        }
    };
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
        result = bounded => result,
    }
}

/// Minimal structural validation against the declared schema: the argument
/// value must be an object when the schema says so, and every `required`
/// property must be present.
fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(ToolError::InvalidArgs(format!(
            "expected an argument object, got {args}"
        )));
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none() {
                return Err(ToolError::InvalidArgs(format!(
                    "missing required argument `{key}`"
                )));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
