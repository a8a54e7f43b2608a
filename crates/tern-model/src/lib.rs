// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod catalog;
mod mock;
mod provider;
mod types;

pub use catalog::{InputModality, ModelInfo, ModelRegistry};
pub use mock::{MockAdapter, ScriptedAdapter};
pub use provider::{
    CompletionRequest, MalformedToolCall, ProviderAdapter, ProviderEvent, ProviderStream,
    ToolCallAssembler, ToolSchema,
};
pub use types::{
    blob_ref, blob_ref_id, estimate_text_tokens, ContentPart, InternalMessage, MessageMetadata,
    QueuedMessage, Role, TokenUsage, ToolCallRequest, BLOB_REF_PREFIX,
};
