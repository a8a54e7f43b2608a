// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shell-command pattern keys for the bash approval layer.
//!
//! A pattern key is the command's program plus its first subcommand or flag
//! (`git commit`, `cargo build`, `ls -la`).  Remembering a key approves
//! future commands with the same shape without widening to the whole
//! program.  Keys are never derived for programs where a prefix says
//! nothing about safety.

/// Programs for which no pattern key is derived.
const REFUSED_PROGRAMS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "shred", "sudo", "doas", "su", "chown", "chmod", "kill",
    "killall", "shutdown", "reboot", "halt", "eval", "exec", "source",
];

/// Derive the pattern key for a shell command.
///
/// Returns `None` for empty input and for refused programs.
pub fn derive_pattern_key(command: &str) -> Option<String> {
    let mut tokens = command.split_whitespace();
    let program = tokens.next()?;
    let program_name = program.rsplit('/').next().unwrap_or(program);
    if REFUSED_PROGRAMS.contains(&program_name) {
        return None;
    }
    match tokens.next() {
        // Stop at shell metacharacters and substitutions: the second token
        // no longer describes the command's shape.
        Some(second) if !second.contains(['|', ';', '&', '>', '<', '$', '`']) => {
            Some(format!("{program_name} {second}"))
        }
        _ => Some(program_name.to_string()),
    }
}

/// Candidate patterns for a command, most specific first.
///
/// Shown when the user opts to remember an approval: e.g. for
/// `git commit -m "x"` the list is `["git commit -m", "git commit", "git"]`.
pub fn pattern_suggestions(command: &str) -> Vec<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(program) = tokens.first() else {
        return Vec::new();
    };
    let program_name = program.rsplit('/').next().unwrap_or(program);
    if REFUSED_PROGRAMS.contains(&program_name) {
        return Vec::new();
    }
    let mut out = Vec::new();
    let clean = |t: &&str| !t.contains(['|', ';', '&', '>', '<', '$', '`']);
    if tokens.len() >= 3 && tokens[1..3].iter().all(clean) {
        out.push(format!("{program_name} {} {}", tokens[1], tokens[2]));
    }
    if tokens.len() >= 2 && clean(&tokens[1]) {
        out.push(format!("{program_name} {}", tokens[1]));
    }
    out.push(program_name.to_string());
    out.dedup();
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_program_plus_subcommand() {
        assert_eq!(derive_pattern_key("git commit -m x").as_deref(), Some("git commit"));
        assert_eq!(derive_pattern_key("cargo build --release").as_deref(), Some("cargo build"));
    }

    #[test]
    fn key_for_bare_program() {
        assert_eq!(derive_pattern_key("ls").as_deref(), Some("ls"));
    }

    #[test]
    fn key_includes_leading_flag() {
        assert_eq!(derive_pattern_key("ls -la /tmp").as_deref(), Some("ls -la"));
    }

    #[test]
    fn refused_for_dangerous_programs() {
        assert_eq!(derive_pattern_key("rm -rf /"), None);
        assert_eq!(derive_pattern_key("sudo apt install x"), None);
        assert_eq!(derive_pattern_key("dd if=/dev/zero of=/dev/sda"), None);
    }

    #[test]
    fn refused_for_dangerous_program_behind_path() {
        assert_eq!(derive_pattern_key("/bin/rm file"), None);
    }

    #[test]
    fn empty_command_has_no_key() {
        assert_eq!(derive_pattern_key(""), None);
        assert_eq!(derive_pattern_key("   "), None);
    }

    #[test]
    fn metacharacter_stops_key_at_program() {
        assert_eq!(derive_pattern_key("echo $(whoami)").as_deref(), Some("echo"));
    }

    #[test]
    fn suggestions_widen_from_specific_to_general() {
        let s = pattern_suggestions("git commit -m \"msg\"");
        assert_eq!(s, vec!["git commit -m", "git commit", "git"]);
    }

    #[test]
    fn suggestions_for_bare_program() {
        assert_eq!(pattern_suggestions("ls"), vec!["ls"]);
    }

    #[test]
    fn suggestions_empty_for_refused() {
        assert!(pattern_suggestions("rm -rf /").is_empty());
    }
}
