// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Fully-qualified tool identifiers.
//!
//! The wire form keeps the source prefix users see (`internal--edit`,
//! `custom--deploy`, `mcp--fs--read_file`); internally the source is a
//! typed variant so routing never re-parses strings.

use regex::Regex;

use crate::tool::ToolError;

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Internal,
    Custom,
    Mcp {
        /// Server segment, absent in the short `mcp--<name>` form.
        server: Option<String>,
    },
}

/// A parsed tool identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolId {
    pub source: ToolSource,
    pub name: String,
}

impl ToolId {
    pub fn internal(name: impl Into<String>) -> Self {
        Self { source: ToolSource::Internal, name: name.into() }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self { source: ToolSource::Custom, name: name.into() }
    }

    pub fn mcp(server: Option<String>, name: impl Into<String>) -> Self {
        Self { source: ToolSource::Mcp { server }, name: name.into() }
    }

    /// Parse the wire form.  A name without a source prefix is unresolvable
    /// and rejected.
    pub fn parse(s: &str) -> Result<Self, ToolError> {
        let mut segments = s.splitn(2, "--");
        let prefix = segments.next().unwrap_or_default();
        let rest = segments.next().filter(|r| !r.is_empty());
        match (prefix, rest) {
            ("internal", Some(name)) => Ok(Self::internal(name)),
            ("custom", Some(name)) => Ok(Self::custom(name)),
            ("mcp", Some(rest)) => {
                // `mcp--<server>--<name>` when a second separator exists,
                // otherwise the serverless short form.
                match rest.split_once("--") {
                    Some((server, name)) if !server.is_empty() && !name.is_empty() => {
                        Ok(Self::mcp(Some(server.to_string()), name))
                    }
                    _ => Ok(Self::mcp(None, rest)),
                }
            }
            _ => Err(ToolError::UnqualifiedId(s.to_string())),
        }
    }

    pub fn is_mcp(&self) -> bool {
        matches!(self.source, ToolSource::Mcp { .. })
    }

    /// `true` for tools whose calls carry shell commands eligible for the
    /// bash-pattern allow set.
    pub fn is_bash(&self) -> bool {
        self.name == "bash" || self.name == "shell"
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            ToolSource::Internal => write!(f, "internal--{}", self.name),
            ToolSource::Custom => write!(f, "custom--{}", self.name),
            ToolSource::Mcp { server: Some(s) } => write!(f, "mcp--{s}--{}", self.name),
            ToolSource::Mcp { server: None } => write!(f, "mcp--{}", self.name),
        }
    }
}

// ─── Pattern matching ─────────────────────────────────────────────────────────

/// Match a fully-qualified tool id against an allow/deny pattern.
///
/// Supported forms:
/// - exact id match
/// - `*`/`?` globs (`mcp--fs--*`)
/// - server-eliding suffix match: pattern `mcp--read_file` matches
///   `mcp--<any server>--read_file`
pub fn matches_pattern(id: &str, pattern: &str) -> bool {
    if id == pattern {
        return true;
    }
    if pattern.contains('*') || pattern.contains('?') {
        if let Some(re) = glob_to_regex(pattern) {
            return re.is_match(id);
        }
    }
    // Server-eliding suffix form.
    if let (Ok(id_parsed), Ok(pat_parsed)) = (ToolId::parse(id), ToolId::parse(pattern)) {
        if let (
            ToolSource::Mcp { server: Some(_) },
            ToolSource::Mcp { server: None },
        ) = (&id_parsed.source, &pat_parsed.source)
        {
            return id_parsed.name == pat_parsed.name;
        }
    }
    false
}

/// Convert a simple shell glob to a [`Regex`].  Only `*` (match anything)
/// and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn parse_internal() {
        let id = ToolId::parse("internal--echo").unwrap();
        assert_eq!(id.source, ToolSource::Internal);
        assert_eq!(id.name, "echo");
    }

    #[test]
    fn parse_mcp_with_server() {
        let id = ToolId::parse("mcp--fs--read_file").unwrap();
        assert_eq!(id.source, ToolSource::Mcp { server: Some("fs".into()) });
        assert_eq!(id.name, "read_file");
    }

    #[test]
    fn parse_mcp_without_server() {
        let id = ToolId::parse("mcp--read_file").unwrap();
        assert_eq!(id.source, ToolSource::Mcp { server: None });
        assert_eq!(id.name, "read_file");
    }

    #[test]
    fn parse_bare_name_is_rejected() {
        assert!(matches!(
            ToolId::parse("read_file"),
            Err(ToolError::UnqualifiedId(_))
        ));
    }

    #[test]
    fn parse_empty_name_is_rejected() {
        assert!(ToolId::parse("internal--").is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["internal--echo", "custom--deploy", "mcp--fs--read_file", "mcp--read_file"] {
            assert_eq!(ToolId::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn mcp_name_may_contain_separator() {
        let id = ToolId::parse("mcp--fs--read--file").unwrap();
        assert_eq!(id.name, "read--file");
    }

    #[test]
    fn bash_detection() {
        assert!(ToolId::parse("internal--bash").unwrap().is_bash());
        assert!(ToolId::parse("internal--shell").unwrap().is_bash());
        assert!(!ToolId::parse("internal--edit").unwrap().is_bash());
    }

    // ── Pattern matching ──────────────────────────────────────────────────────

    #[test]
    fn exact_match() {
        assert!(matches_pattern("internal--echo", "internal--echo"));
        assert!(!matches_pattern("internal--echo", "internal--other"));
    }

    #[test]
    fn suffix_match_elides_server() {
        assert!(matches_pattern("mcp--fs--read_file", "mcp--read_file"));
        assert!(!matches_pattern("mcp--fs--write_file", "mcp--read_file"));
    }

    #[test]
    fn suffix_match_does_not_apply_to_internal() {
        assert!(!matches_pattern("internal--read_file", "mcp--read_file"));
    }

    #[test]
    fn glob_matches_prefix() {
        assert!(matches_pattern("mcp--fs--read_file", "mcp--fs--*"));
        assert!(!matches_pattern("mcp--web--fetch", "mcp--fs--*"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(matches_pattern("internal--t1", "internal--t?"));
        assert!(!matches_pattern("internal--t12", "internal--t?"));
    }
}
