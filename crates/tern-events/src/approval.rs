// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of decision is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    ToolConfirmation,
    DirectoryAccess,
    Elicitation,
}

/// Outcome of an approval rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Denied,
    Cancelled,
}

/// A request awaiting an external policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub approval_type: ApprovalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Request-specific context: tool name, args preview, paths, prompts.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        approval_type: ApprovalType,
        session_id: Option<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            approval_type,
            session_id,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// The decision for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub id: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Handler-supplied payload, e.g. elicitation answers or remember flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ApprovalResponse {
    pub fn approved(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ApprovalStatus::Approved,
            reason: None,
            data: None,
            session_id: None,
        }
    }

    pub fn denied(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ApprovalStatus::Denied,
            reason: Some(reason.into()),
            data: None,
            session_id: None,
        }
    }

    pub fn cancelled(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ApprovalStatus::Cancelled,
            reason: Some(reason.into()),
            data: None,
            session_id: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    /// `true` when the handler asked to remember this decision for the tool.
    pub fn remember_choice(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("rememberChoice"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `true` when the handler asked to remember the bash pattern.
    pub fn remember_pattern(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("rememberPattern"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
