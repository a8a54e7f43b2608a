// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registry for tool executions detached from their turn.
//!
//! A background call returns a stub to the model immediately; the real
//! result stays here until collected.  Completions never re-open the turn's
//! event stream — a notify-on-complete call instead pushes a note through
//! the configured [`BackgroundNotifier`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::tool::ToolError;

/// Delivery channel for background completion notes (typically the owning
/// session's message queue).
pub trait BackgroundNotifier: Send + Sync {
    fn notify(&self, session_id: &str, note: String);
}

struct BackgroundTask {
    description: String,
    handle: JoinHandle<Result<Value, ToolError>>,
}

/// Shared registry of running and finished background tasks.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tasks: Arc<Mutex<HashMap<String, BackgroundTask>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` as a detached task and return its id.
    ///
    /// When `notify` is set, a short completion note is pushed to the
    /// notifier once the task finishes (the result itself stays collectable
    /// via [`take_result`](Self::take_result)).
    pub fn spawn<F>(
        &self,
        description: impl Into<String>,
        tool_name: String,
        session_id: Option<String>,
        notify: Option<Arc<dyn BackgroundNotifier>>,
        fut: F,
    ) -> String
    where
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let description = description.into();
        let id_for_task = task_id.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            match (&result, notify, session_id) {
                (outcome, Some(notifier), Some(session)) => {
                    let status = if outcome.is_ok() { "completed" } else { "failed" };
                    notifier.notify(
                        &session,
                        format!("Background task {id_for_task} ({tool_name}) {status}."),
                    );
                }
                (Err(e), None, _) => {
                    warn!(task_id = %id_for_task, error = %e, "background task failed");
                }
                _ => debug!(task_id = %id_for_task, "background task finished"),
            }
            result
        });
        self.tasks
            .lock()
            .expect("background task map poisoned")
            .insert(task_id.clone(), BackgroundTask { description, handle });
        task_id
    }

    /// Await and remove one task's result.
    pub async fn take_result(&self, task_id: &str) -> Result<Value, ToolError> {
        let task = self
            .tasks
            .lock()
            .expect("background task map poisoned")
            .remove(task_id)
            .ok_or_else(|| ToolError::NotFound(task_id.to_string()))?;
        match task.handle.await {
            Ok(result) => result,
            Err(e) => Err(ToolError::Panicked(e.to_string())),
        }
    }

    pub fn description(&self, task_id: &str) -> Option<String> {
        self.tasks
            .lock()
            .expect("background task map poisoned")
            .get(task_id)
            .map(|t| t.description.clone())
    }

    pub fn running_count(&self) -> usize {
        self.tasks.lock().expect("background task map poisoned").len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
