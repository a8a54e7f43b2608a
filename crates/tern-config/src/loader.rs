// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use crate::{ConfigError, Settings};

/// Load settings from a YAML file.
///
/// Missing fields fall back to their serde defaults; validation is a
/// separate step ([`Settings::validated`]) so callers can adjust loaded
/// values programmatically before committing to them.
pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load settings from `path` if it exists, otherwise return defaults.
pub fn load_or_default(path: &Path) -> Result<Settings, ConfigError> {
    if path.is_file() {
        load(path)
    } else {
        Ok(Settings::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
