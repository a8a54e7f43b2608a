// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Approval rendezvous between the tool layer and an external policy
//! handler.
//!
//! Every request is tracked in a pending map keyed by approval id.  The
//! handler may answer inline (returning a response from `handle`) or later
//! through [`ApprovalManager::resolve`] — both paths fulfil the same oneshot.
//! Requests that outlive the configured timeout resolve as cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tern_events::{
    AgentEvent, ApprovalRequest, ApprovalResponse, ApprovalStatus, ApprovalType, EventBus,
    EventEnvelope,
};

/// External policy implementation.
///
/// Return `Some(response)` to decide inline, or `None` when the decision
/// will arrive later via [`ApprovalManager::resolve`] (interactive UIs).
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn handle(&self, request: ApprovalRequest) -> Option<ApprovalResponse>;
}

struct Pending {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalResponse>,
}

struct Inner {
    handler: Arc<dyn ApprovalHandler>,
    bus: EventBus,
    timeout_ms: u64,
    pending: Mutex<HashMap<String, Pending>>,
    /// Per-session allowed shell-command pattern keys.
    bash_patterns: Mutex<HashMap<String, HashSet<String>>>,
}

/// Cheap-to-clone rendezvous point; the handler is a required collaborator
/// supplied at construction.
#[derive(Clone)]
pub struct ApprovalManager {
    inner: Arc<Inner>,
}

impl ApprovalManager {
    pub fn new(handler: Arc<dyn ApprovalHandler>, bus: EventBus, timeout_ms: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                bus,
                timeout_ms,
                pending: Mutex::new(HashMap::new()),
                bash_patterns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Issue a request and wait for its resolution.
    ///
    /// Never fails: timeouts and handler disappearance resolve as cancelled
    /// responses that callers translate into in-band tool errors.
    pub async fn request_approval(
        &self,
        approval_type: ApprovalType,
        session_id: Option<String>,
        metadata: Value,
    ) -> ApprovalResponse {
        let request = ApprovalRequest::new(approval_type, session_id.clone(), metadata);
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(id.clone(), Pending { request: request.clone(), tx });

        // Subscribers must observe the request before the handler can
        // possibly resolve it.
        self.inner
            .bus
            .emit(EventEnvelope {
                session_id: session_id.clone(),
                event: AgentEvent::ApprovalRequested {
                    approval_id: id.clone(),
                    approval_type,
                    metadata: request.metadata.clone(),
                },
            })
            .await;

        // The handler runs detached: an interactive UI may take arbitrarily
        // long, and may resolve through `resolve` rather than by returning.
        let mgr = self.clone();
        tokio::spawn(async move {
            if let Some(response) = mgr.inner.handler.handle(request).await {
                mgr.resolve(response).await;
            }
        });

        let timeout_ms = self.inner.timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Sender dropped without resolution (cancel_all raced the
                // removal); treat as external cancellation.
                ApprovalResponse::cancelled(id, "external")
            }
            Err(_) => {
                self.inner.pending.lock().expect("pending map poisoned").remove(&id);
                warn!(approval_id = %id, timeout_ms, "approval request timed out");
                let mut response = ApprovalResponse::cancelled(id, "timeout");
                response.data = Some(serde_json::json!({ "timeoutMs": timeout_ms }));
                response.session_id = session_id.clone();
                self.emit_resolution(&response).await;
                response
            }
        }
    }

    /// Fulfil a pending request.  Returns `false` when the id is unknown
    /// (already resolved, timed out, or never issued).
    pub async fn resolve(&self, response: ApprovalResponse) -> bool {
        let pending = self
            .inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&response.id);
        match pending {
            Some(p) => {
                self.emit_resolution(&response).await;
                // The requester may have timed out concurrently; a closed
                // receiver is fine.
                let _ = p.tx.send(response);
                true
            }
            None => {
                debug!(approval_id = %response.id, "resolution for unknown approval id");
                false
            }
        }
    }

    /// Approve all pending requests matching `predicate`.
    ///
    /// Responses produced here never carry remember flags: a blanket
    /// resolution must not widen any persistent allow list.
    pub async fn auto_approve_pending<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ApprovalRequest) -> bool,
    {
        // Snapshot ids first: resolve mutates the map.
        let ids: Vec<String> = {
            let pending = self.inner.pending.lock().expect("pending map poisoned");
            pending
                .values()
                .filter(|p| predicate(&p.request))
                .map(|p| p.request.id.clone())
                .collect()
        };
        let mut resolved = 0;
        for id in ids {
            if self.resolve(ApprovalResponse::approved(id)).await {
                resolved += 1;
            }
        }
        resolved
    }

    pub async fn cancel_approval(&self, id: &str) -> bool {
        self.resolve(ApprovalResponse::cancelled(id, "external")).await
    }

    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = {
            let pending = self.inner.pending.lock().expect("pending map poisoned");
            pending.keys().cloned().collect()
        };
        let mut resolved = 0;
        for id in ids {
            if self.cancel_approval(&id).await {
                resolved += 1;
            }
        }
        resolved
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending map poisoned").len()
    }

    // ── Bash patterns ─────────────────────────────────────────────────────────

    pub fn add_bash_pattern(&self, session_id: &str, key: impl Into<String>) {
        self.inner
            .bash_patterns
            .lock()
            .expect("bash patterns poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(key.into());
    }

    pub fn matches_bash_pattern(&self, session_id: &str, key: &str) -> bool {
        self.inner
            .bash_patterns
            .lock()
            .expect("bash patterns poisoned")
            .get(session_id)
            .is_some_and(|set| set.contains(key))
    }

    async fn emit_resolution(&self, response: &ApprovalResponse) {
        self.inner
            .bus
            .emit(EventEnvelope {
                session_id: response.session_id.clone(),
                event: AgentEvent::ApprovalResolved {
                    approval_id: response.id.clone(),
                    status: response.status,
                    reason: response.reason.clone(),
                    data: response.data.clone(),
                },
            })
            .await;
    }
}

/// Handler that always answers with a fixed status.  Useful for headless
/// runs and tests.
pub struct StaticApprovalHandler {
    status: ApprovalStatus,
}

impl StaticApprovalHandler {
    pub fn approving() -> Self {
        Self { status: ApprovalStatus::Approved }
    }

    pub fn denying() -> Self {
        Self { status: ApprovalStatus::Denied }
    }
}

#[async_trait]
impl ApprovalHandler for StaticApprovalHandler {
    async fn handle(&self, request: ApprovalRequest) -> Option<ApprovalResponse> {
        Some(match self.status {
            ApprovalStatus::Approved => ApprovalResponse::approved(request.id),
            ApprovalStatus::Denied => ApprovalResponse::denied(request.id, "denied by policy"),
            ApprovalStatus::Cancelled => ApprovalResponse::cancelled(request.id, "external"),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
