// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::types::ContentPart;

/// Input modalities a model can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
    File,
}

/// Static description of one `(provider, model)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub input_modalities: Vec<InputModality>,
    /// MIME prefixes this model accepts for file/resource input, e.g.
    /// `"image/"` or `"application/pdf"`.  Empty means the capability set
    /// is unknown and validators should retain rather than drop.
    pub supported_mime_prefixes: Vec<String>,
}

impl ModelInfo {
    pub fn supports_modality(&self, m: InputModality) -> bool {
        self.input_modalities.contains(&m)
    }

    /// Three-valued mime check: `Some(true)` supported, `Some(false)`
    /// known-unsupported, `None` unknown (the capability list is empty).
    pub fn supports_mime(&self, mime: &str) -> Option<bool> {
        if self.supported_mime_prefixes.is_empty() {
            return None;
        }
        Some(self.supported_mime_prefixes.iter().any(|p| mime.starts_with(p.as_str())))
    }

    /// Whether a content part can be sent to this model.
    ///
    /// `None` means the validator cannot tell; callers retain the part and
    /// log rather than silently dropping user input.
    pub fn supports_part(&self, part: &ContentPart) -> Option<bool> {
        match part {
            ContentPart::Text { .. } => Some(true),
            ContentPart::Image { mime, .. } => {
                if !self.supports_modality(InputModality::Image) {
                    return Some(false);
                }
                self.supports_mime(mime)
            }
            ContentPart::File { mime, .. } => {
                if !self.supports_modality(InputModality::File) {
                    return Some(false);
                }
                self.supports_mime(mime)
            }
            // Rendered UI resources are a consumer-side concern; whether a
            // model can use the raw payload is not knowable from the catalog.
            ContentPart::UiResource { .. } => None,
        }
    }
}

/// Registry of known models, seeded from the builtin catalog.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelInfo>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { entries: builtin_catalog() }
    }

    /// Add or replace an entry (matched by provider + name).
    pub fn register(&mut self, info: ModelInfo) {
        self.entries
            .retain(|e| !(e.provider == info.provider && e.name == info.name));
        self.entries.push(info);
    }

    pub fn lookup(&self, provider: &str, name: &str) -> Option<&ModelInfo> {
        self.entries
            .iter()
            .find(|e| e.provider == provider && e.name == name)
    }

    /// Lookup with a conservative text-only fallback for unknown models.
    pub fn lookup_or_default(&self, provider: &str, name: &str) -> ModelInfo {
        self.lookup(provider, name).cloned().unwrap_or_else(|| ModelInfo {
            provider: provider.to_string(),
            name: name.to_string(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            input_modalities: vec![InputModality::Text],
            supported_mime_prefixes: Vec::new(),
        })
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_catalog() -> Vec<ModelInfo> {
    let m = |provider: &str,
             name: &str,
             context_window: u32,
             max_output_tokens: u32,
             modalities: &[InputModality],
             mimes: &[&str]| ModelInfo {
        provider: provider.into(),
        name: name.into(),
        context_window,
        max_output_tokens,
        input_modalities: modalities.to_vec(),
        supported_mime_prefixes: mimes.iter().map(|s| s.to_string()).collect(),
    };
    use InputModality::*;
    vec![
        m(
            "anthropic",
            "claude-sonnet-4-5",
            200_000,
            64_000,
            &[Text, Image, File],
            &["image/", "application/pdf", "text/"],
        ),
        m(
            "anthropic",
            "claude-haiku-4-5",
            200_000,
            64_000,
            &[Text, Image],
            &["image/", "text/"],
        ),
        m(
            "openai",
            "gpt-4o",
            128_000,
            16_384,
            &[Text, Image],
            &["image/png", "image/jpeg", "image/webp", "image/gif", "text/"],
        ),
        m("openai", "gpt-4o-mini", 128_000, 16_384, &[Text, Image], &["image/", "text/"]),
        m(
            "google",
            "gemini-2.5-pro",
            1_048_576,
            65_536,
            &[Text, Image, File],
            &["image/", "application/pdf", "audio/", "video/", "text/"],
        ),
        // Deterministic test model: text-only, small window so compaction
        // paths are easy to exercise.
        m("mock", "mock-model", 32_000, 4_096, &[Text], &["text/"]),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
