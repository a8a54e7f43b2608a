// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should default to enabled need a named
/// function.
fn default_true() -> bool {
    true
}

/// How tool calls are approved when no policy layer has already decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Rendezvous with the external approval handler for every call.
    #[default]
    Manual,
    /// Approve every call without asking.
    AutoApprove,
    /// Deny every call without asking.
    AutoDeny,
}

/// Prompt style used by the model-driven compaction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStyle {
    /// Free-form narrative summary of the conversation so far.
    Narrative,
    /// Fixed-section state checkpoint (task, decisions, files, pending).
    #[default]
    Structured,
}

/// Static allow/deny patterns applied to fully-qualified tool ids.
///
/// Patterns support `*`/`?` globs plus the MCP server-eliding suffix form:
/// `mcp--read_file` matches `mcp--<any server>--read_file`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicies {
    #[serde(default)]
    pub always_allow: Vec<String>,
    #[serde(default)]
    pub always_deny: Vec<String>,
}

/// Compaction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Messages preserved verbatim at the tail when a summary is produced.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Prompt style for the model-driven strategy.
    #[serde(default)]
    pub style: SummaryStyle,
}

fn default_keep_recent() -> usize {
    10
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self { keep_recent: default_keep_recent(), style: SummaryStyle::default() }
    }
}

/// Reference to the active model in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub name: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self { provider: "mock".into(), name: "mock-model".into() }
    }
}

/// Top-level runtime settings.
///
/// All fields have serde defaults so a partial YAML file (or none at all)
/// yields a working configuration.  Construction of the runtime requires
/// [`ValidatedSettings`], obtained through [`Settings::validated`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Upper bound on (model call → tool dispatch) iterations per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Context-window fraction at which compaction triggers (0.0–1.0).
    /// 1.0 disables automatic compaction unless the strategy overrides it.
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f32,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// How long an approval rendezvous waits before resolving as cancelled.
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
    #[serde(default)]
    pub tool_policies: ToolPolicies,
    /// Upper bound on messages queued against a busy session.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Capacity of each subscriber's event queue.  When a subscriber falls
    /// this far behind, the emitting turn awaits rather than dropping.
    #[serde(default = "default_per_stream_queue_capacity")]
    pub per_stream_queue_capacity: usize,
    #[serde(default)]
    pub compaction: CompactionSettings,
    /// Allow tools to run detached when the call requests it.
    #[serde(default = "default_true")]
    pub background_tasks: bool,
    /// Tool results newer than this many are never pruned from the
    /// model-facing history.
    #[serde(default = "default_keep_recent_tool_results")]
    pub keep_recent_tool_results: usize,
    #[serde(default)]
    pub model: ModelRef,
    /// System prompt sent with every request.  Rendering richer prompts is
    /// the caller's concern; the runtime forwards this text as-is.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Global tool enablement.  `None` enables every registered tool; a
    /// session may narrow this further but never widen it.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

fn default_max_iterations() -> u32 {
    50
}
fn default_threshold_percent() -> f32 {
    1.0
}
fn default_approval_timeout_ms() -> u64 {
    120_000
}
fn default_max_queued_messages() -> usize {
    100
}
fn default_per_stream_queue_capacity() -> usize {
    256
}
fn default_keep_recent_tool_results() -> usize {
    20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            threshold_percent: default_threshold_percent(),
            approval_mode: ApprovalMode::default(),
            approval_timeout_ms: default_approval_timeout_ms(),
            tool_policies: ToolPolicies::default(),
            max_queued_messages: default_max_queued_messages(),
            per_stream_queue_capacity: default_per_stream_queue_capacity(),
            compaction: CompactionSettings::default(),
            background_tasks: true,
            keep_recent_tool_results: default_keep_recent_tool_results(),
            model: ModelRef::default(),
            system_prompt: None,
            enabled_tools: None,
        }
    }
}

impl Settings {
    /// Consume the settings, checking every range constraint.
    ///
    /// The runtime only accepts [`ValidatedSettings`], so a misconfigured
    /// value is rejected before any session exists.
    pub fn validated(self) -> Result<ValidatedSettings, ConfigError> {
        if self.max_iterations < 1 {
            return Err(ConfigError::OutOfRange {
                field: "max_iterations",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.threshold_percent) {
            return Err(ConfigError::OutOfRange {
                field: "threshold_percent",
                reason: format!("{} is outside 0.0..=1.0", self.threshold_percent),
            });
        }
        if self.approval_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "approval_timeout_ms",
                reason: "must be non-zero".into(),
            });
        }
        if self.max_queued_messages == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_queued_messages",
                reason: "must be non-zero".into(),
            });
        }
        if self.per_stream_queue_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "per_stream_queue_capacity",
                reason: "must be non-zero".into(),
            });
        }
        Ok(ValidatedSettings(self))
    }
}

/// Settings that have passed [`Settings::validated`].
///
/// Derefs to [`Settings`] for read access; there is no way to construct one
/// without going through validation.
#[derive(Debug, Clone)]
pub struct ValidatedSettings(Settings);

impl std::ops::Deref for ValidatedSettings {
    type Target = Settings;
    fn deref(&self) -> &Settings {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    OutOfRange { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
