// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tern_events::{ApprovalStatus, ApprovalType, EventBus};

use crate::id::ToolId;

/// Errors a tool execution can produce.
///
/// These are in-band from the turn loop's perspective: the executor reports
/// them on the stream and appends them to history as tool failures; they
/// never abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error("tool id `{0}` has no source prefix and cannot be resolved")]
    UnqualifiedId(String),
    #[error("execution denied: {reason}")]
    ExecutionDenied { reason: String },
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error("tool task panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// The capabilities a tool may use while executing.
///
/// Deliberately narrow: tools get the session identity, a bus handle for
/// progress events, and the turn's cancel token — never a reference back to
/// the runtime that invoked them.
#[derive(Clone)]
pub struct ToolExecutionContext {
    pub session_id: Option<String>,
    pub bus: EventBus,
    pub cancel: CancellationToken,
}

/// A custom approval requested by the tool itself, consulted before any
/// other layer except static denial.
#[derive(Debug, Clone)]
pub struct ApprovalOverride {
    pub approval_type: ApprovalType,
    pub metadata: Value,
    /// Error text surfaced when the override is denied.
    pub denial_reason: String,
}

/// A locally-executable tool (internal or custom source).
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> ToolId;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn input_schema(&self) -> Value;
    /// Execute with already-approved, schema-validated arguments.
    async fn execute(&self, args: Value, ctx: &ToolExecutionContext) -> Result<Value, ToolError>;
    /// Human-readable preview of what this call would do, shown in approval
    /// prompts.
    fn generate_preview(&self, _args: &Value) -> Option<String> {
        None
    }
    /// A tool-supplied approval requirement that replaces the standard
    /// tool-confirmation flow (e.g. directory access).
    fn approval_override(&self, _args: &Value) -> Option<ApprovalOverride> {
        None
    }
}

/// Listing entry for one tool, as shown to the model.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Fully-qualified wire id.
    pub id: String,
    pub description: String,
    pub input_schema: Value,
}

/// An external source of tools (MCP server behind an opaque client).
///
/// The manager qualifies listed names as `mcp--<server>--<name>`; transport,
/// authentication and capability negotiation are the implementation's
/// concern.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn server_name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;
    /// Execute by bare (unqualified) tool name.
    async fn execute(
        &self,
        name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value, ToolError>;
}

/// Persistence for dynamically remembered tool approvals.
#[async_trait]
pub trait AllowedToolsProvider: Send + Sync {
    async fn is_allowed(&self, tool_id: &str, session_id: Option<&str>) -> bool;
    async fn remember(&self, tool_id: &str, session_id: Option<&str>);
}

/// In-memory remembered-approval store; the default when no persistent
/// backend is wired in.
#[derive(Default)]
pub struct InMemoryAllowedTools {
    allowed: std::sync::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl AllowedToolsProvider for InMemoryAllowedTools {
    async fn is_allowed(&self, tool_id: &str, _session_id: Option<&str>) -> bool {
        self.allowed.lock().expect("allowed set poisoned").contains(tool_id)
    }

    async fn remember(&self, tool_id: &str, _session_id: Option<&str>) {
        self.allowed
            .lock()
            .expect("allowed set poisoned")
            .insert(tool_id.to_string());
    }
}

/// Hooks around tool execution.  `before` may rewrite arguments; `after` may
/// rewrite successful results.
#[async_trait]
pub trait ToolCallPlugin: Send + Sync {
    async fn before_tool_call(
        &self,
        _tool_id: &str,
        _args: &mut Value,
        _ctx: &ToolExecutionContext,
    ) {
    }

    async fn after_tool_result(
        &self,
        _tool_id: &str,
        _result: &mut Value,
        _ctx: &ToolExecutionContext,
    ) {
    }
}

/// Per-call metadata carried inside the model-generated argument object.
///
/// The keys are camelCase because they are part of the model-visible wire
/// surface; they are stripped before the tool sees its arguments.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    pub call_description: Option<String>,
    pub run_in_background: bool,
    pub timeout_ms: Option<u64>,
    pub notify_on_complete: bool,
}

/// Remove and return the call-metadata keys from `args`.
pub fn split_call_metadata(args: &mut Value) -> CallMetadata {
    let Some(map) = args.as_object_mut() else {
        return CallMetadata::default();
    };
    CallMetadata {
        call_description: map
            .remove("callDescription")
            .and_then(|v| v.as_str().map(String::from)),
        run_in_background: map
            .remove("runInBackground")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        timeout_ms: map.remove("timeoutMs").and_then(|v| v.as_u64()),
        notify_on_complete: map
            .remove("notifyOnComplete")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

/// What a tool execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub result: Value,
    /// Whether an approval rendezvous happened for this call.
    pub require_approval: bool,
    pub approval_status: Option<ApprovalStatus>,
}

impl ExecutionResult {
    pub fn direct(result: Value) -> Self {
        Self { result, require_approval: false, approval_status: None }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_metadata_strips_keys() {
        let mut args = json!({
            "path": "/tmp/x",
            "callDescription": "read the file",
            "runInBackground": true,
            "timeoutMs": 5000,
            "notifyOnComplete": true,
        });
        let meta = split_call_metadata(&mut args);
        assert_eq!(meta.call_description.as_deref(), Some("read the file"));
        assert!(meta.run_in_background);
        assert_eq!(meta.timeout_ms, Some(5000));
        assert!(meta.notify_on_complete);
        assert_eq!(args, json!({ "path": "/tmp/x" }));
    }

    #[test]
    fn split_metadata_defaults_when_absent() {
        let mut args = json!({ "path": "/tmp/x" });
        let meta = split_call_metadata(&mut args);
        assert!(meta.call_description.is_none());
        assert!(!meta.run_in_background);
        assert_eq!(meta.timeout_ms, None);
    }

    #[test]
    fn split_metadata_tolerates_non_object() {
        let mut args = json!("just a string");
        let meta = split_call_metadata(&mut args);
        assert!(!meta.run_in_background);
        assert_eq!(args, json!("just a string"));
    }

    #[tokio::test]
    async fn in_memory_allowed_tools_remembers() {
        let store = InMemoryAllowedTools::default();
        assert!(!store.is_allowed("custom--deploy", None).await);
        store.remember("custom--deploy", None).await;
        assert!(store.is_allowed("custom--deploy", None).await);
    }
}
