// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod approval;
pub mod background;
pub mod id;
pub mod manager;
pub mod patterns;
pub mod tool;

pub use approval::{ApprovalHandler, ApprovalManager, StaticApprovalHandler};
pub use background::{BackgroundNotifier, BackgroundTasks};
pub use id::{matches_pattern, ToolId, ToolSource};
pub use manager::ToolManager;
pub use patterns::{derive_pattern_key, pattern_suggestions};
pub use tool::{
    split_call_metadata, AllowedToolsProvider, ApprovalOverride, CallMetadata, ExecutionResult,
    InMemoryAllowedTools, Tool, ToolCallPlugin, ToolDescriptor, ToolError, ToolExecutionContext,
    ToolProvider,
};
