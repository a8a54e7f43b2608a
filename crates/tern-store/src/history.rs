// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session conversation append logs.
//!
//! History is append-only: compaction and pruning are read-time concerns of
//! the context layer, never of storage.  The JSONL backend writes one
//! serde-encoded message per line to `<dir>/<session>.jsonl`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use tern_model::InternalMessage;

use crate::StoreError;

/// Append-log of messages keyed by session id.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn append(&self, session_id: &str, msg: &InternalMessage) -> Result<(), StoreError>;
    async fn read(&self, session_id: &str) -> Result<Vec<InternalMessage>, StoreError>;
    async fn clear(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Volatile per-process history, the default for tests and embedded use.
#[derive(Default)]
pub struct InMemoryHistory {
    sessions: Mutex<HashMap<String, Vec<InternalMessage>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryProvider for InMemoryHistory {
    async fn append(&self, session_id: &str, msg: &InternalMessage) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(msg.clone());
        Ok(())
    }

    async fn read(&self, session_id: &str) -> Result<Vec<InternalMessage>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }
}

/// File-backed history: one JSONL file per session under `dir`.
pub struct JsonlHistory {
    dir: PathBuf,
    /// Serializes writers per process; the log itself is single-writer per
    /// session by contract.
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        // Session ids are opaque; keep only filesystem-safe characters so a
        // hostile id cannot escape the directory.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn read_file(path: &Path) -> Result<Vec<InternalMessage>, StoreError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io { path: path.display().to_string(), source })
            }
        };
        let mut messages = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    // A torn trailing write must not make the whole session
                    // unreadable.
                    warn!(path = %path.display(), error = %e, "skipping corrupt history line");
                }
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl HistoryProvider for JsonlHistory {
    async fn append(&self, session_id: &str, msg: &InternalMessage) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let line = serde_json::to_string(msg).expect("message serialization is infallible");
        let _guard = self.write_lock.lock().await;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Io { path: path.display().to_string(), source })?;
        writeln!(file, "{line}")
            .map_err(|source| StoreError::Io { path: path.display().to_string(), source })?;
        Ok(())
    }

    async fn read(&self, session_id: &str) -> Result<Vec<InternalMessage>, StoreError> {
        Self::read_file(&self.session_path(session_id))
    }

    async fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path: path.display().to_string(), source }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
