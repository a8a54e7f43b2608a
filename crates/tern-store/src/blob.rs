// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-addressed blob storage.
//!
//! Large payloads (images, files) live here; messages carry `@blob:<id>`
//! references until the context layer inlines them for a model call.  Ids
//! are the hex SHA-256 of the content, so storing the same bytes twice is a
//! no-op.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use tern_model::blob_ref;

use crate::StoreError;

/// Descriptive metadata stored alongside blob bytes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BlobMetadata {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    /// Who produced the blob: `user`, `tool`, `provider`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Handle returned by a store operation.
#[derive(Debug, Clone)]
pub struct BlobRef {
    pub id: String,
    /// The `@blob:<id>` reference messages embed.
    pub uri: String,
    pub metadata: BlobMetadata,
}

/// A resolved blob.
#[derive(Debug, Clone)]
pub struct Blob {
    pub id: String,
    pub bytes: Vec<u8>,
    pub metadata: BlobMetadata,
}

impl Blob {
    pub fn as_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, metadata: BlobMetadata) -> Result<BlobRef, StoreError>;
    async fn read(&self, id: &str) -> Result<Blob, StoreError>;

    /// Store a base64 payload as produced by message content.
    async fn store_base64(
        &self,
        data: &str,
        metadata: BlobMetadata,
    ) -> Result<BlobRef, StoreError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| StoreError::InvalidBase64(e.to_string()))?;
        self.store(bytes, metadata).await
    }
}

fn content_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Process-local blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Blob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, bytes: Vec<u8>, metadata: BlobMetadata) -> Result<BlobRef, StoreError> {
        let id = content_id(&bytes);
        let reference = BlobRef { id: id.clone(), uri: blob_ref(&id), metadata: metadata.clone() };
        self.blobs
            .lock()
            .await
            .entry(id.clone())
            .or_insert(Blob { id, bytes, metadata });
        Ok(reference)
    }

    async fn read(&self, id: &str) -> Result<Blob, StoreError> {
        self.blobs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(id.to_string()))
    }
}

/// Filesystem blob store: `<dir>/<id>` holds the bytes, `<dir>/<id>.meta`
/// the metadata JSON.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.meta"))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, bytes: Vec<u8>, metadata: BlobMetadata) -> Result<BlobRef, StoreError> {
        let id = content_id(&bytes);
        let data_path = self.data_path(&id);
        if !data_path.exists() {
            std::fs::write(&data_path, &bytes).map_err(|source| StoreError::Io {
                path: data_path.display().to_string(),
                source,
            })?;
            let meta_path = self.meta_path(&id);
            let meta_json =
                serde_json::to_vec(&metadata).expect("metadata serialization is infallible");
            std::fs::write(&meta_path, meta_json).map_err(|source| StoreError::Io {
                path: meta_path.display().to_string(),
                source,
            })?;
        }
        Ok(BlobRef { uri: blob_ref(&id), id, metadata })
    }

    async fn read(&self, id: &str) -> Result<Blob, StoreError> {
        let data_path = self.data_path(id);
        let bytes = match std::fs::read(&data_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(id.to_string()))
            }
            Err(source) => {
                return Err(StoreError::Io { path: data_path.display().to_string(), source })
            }
        };
        let meta_path = self.meta_path(id);
        let metadata = match std::fs::read(&meta_path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                path: meta_path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BlobMetadata::default(),
            Err(source) => {
                return Err(StoreError::Io { path: meta_path.display().to_string(), source })
            }
        };
        Ok(Blob { id: id.to_string(), bytes, metadata })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
