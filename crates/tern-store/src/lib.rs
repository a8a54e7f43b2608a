// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod blob;
mod history;

pub use blob::{Blob, BlobMetadata, BlobRef, BlobStore, FsBlobStore, InMemoryBlobStore};
pub use history::{HistoryProvider, InMemoryHistory, JsonlHistory};

/// Storage-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record in {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
