//! Approval rule storage and matching
//!
//! Rules pre-approve tool actions so repeated identical work does not
//! re-prompt the host. Matching is deliberately narrow:
//!
//! - `*` matches everything, and an exact match always matches
//! - the shell-execution tool honors only exact match or an explicit
//!   trailing wildcard (`prefix *` or `prefix:*`) — implicit prefix
//!   matching on shell commands is a security hazard
//! - file-path tools match by path prefix respecting segment boundaries
//!   (a rule for `/a/b` must not match `/a/bc`)
//! - everything else falls back to simple string prefix

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// How a tool's action string is interpreted for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolArgKind {
    /// Shell command execution
    Shell,
    /// Operates on a single file path
    FilePath,
    /// Anything else
    Other,
}

impl ToolArgKind {
    pub fn of(tool_name: &str) -> Self {
        match tool_name.to_ascii_lowercase().as_str() {
            "bash" | "shell" | "execute" => ToolArgKind::Shell,
            "read" | "write" | "edit" | "multi_edit" | "patch" | "ls" | "glob" => {
                ToolArgKind::FilePath
            }
            _ => ToolArgKind::Other,
        }
    }
}

/// The action string a rule is matched against.
pub fn action_of(tool_name: &str, input: &serde_json::Value) -> String {
    match ToolArgKind::of(tool_name) {
        ToolArgKind::Shell => input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ToolArgKind::FilePath => input
            .get("file_path")
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ToolArgKind::Other => serde_json::to_string(input).unwrap_or_default(),
    }
}

/// Check one pattern against one action string.
pub fn pattern_matches(kind: ToolArgKind, pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == action {
        return true;
    }

    match kind {
        ToolArgKind::Shell => shell_wildcard_matches(pattern, action),
        ToolArgKind::FilePath => path_prefix_matches(pattern, action),
        ToolArgKind::Other => action.starts_with(pattern),
    }
}

/// Only explicit trailing wildcards are honored for shell commands, and
/// the prefix must end at a word boundary: `git *` matches `git status`
/// but never `gitstatus`.
fn shell_wildcard_matches(pattern: &str, action: &str) -> bool {
    let prefix = if let Some(prefix) = pattern.strip_suffix(" *") {
        prefix
    } else if let Some(prefix) = pattern.strip_suffix(":*") {
        prefix
    } else {
        return false;
    };

    if action == prefix {
        return true;
    }
    match action.strip_prefix(prefix).and_then(|rest| rest.chars().next()) {
        Some(' ') | Some(':') => true,
        _ => false,
    }
}

/// Path prefix match respecting segment boundaries.
fn path_prefix_matches(pattern: &str, action: &str) -> bool {
    let pattern = pattern.trim_end_matches('/');
    if pattern.is_empty() {
        return false;
    }
    match action.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Scope of a stored rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Lives until the session core is reset
    Session,
    /// Loaded from / persisted to the project settings store
    Permanent,
}

/// Allow rules grouped by tool name, with session-scoped and permanent
/// tiers. Tool names are case-insensitive.
#[derive(Debug, Default)]
pub struct RuleBook {
    session: RwLock<HashMap<String, Vec<String>>>,
    permanent: RwLock<HashMap<String, Vec<String>>>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any stored rule pre-approves this invocation.
    pub fn is_pre_approved(&self, tool_name: &str, input: &serde_json::Value) -> bool {
        let key = tool_name.to_ascii_lowercase();
        let kind = ToolArgKind::of(tool_name);
        let action = action_of(tool_name, input);

        let check = |table: &HashMap<String, Vec<String>>| {
            table
                .get(&key)
                .map(|patterns| {
                    patterns
                        .iter()
                        .any(|pattern| pattern_matches(kind, pattern, &action))
                })
                .unwrap_or(false)
        };

        check(&self.session.read().unwrap()) || check(&self.permanent.read().unwrap())
    }

    pub fn add(&self, scope: RuleScope, tool_name: &str, pattern: impl Into<String>) {
        let table = match scope {
            RuleScope::Session => &self.session,
            RuleScope::Permanent => &self.permanent,
        };
        table
            .write()
            .unwrap()
            .entry(tool_name.to_ascii_lowercase())
            .or_default()
            .push(pattern.into());
    }

    /// Load permanent rules from the project settings store.
    pub fn load_permanent(&self, rules: impl IntoIterator<Item = (String, String)>) {
        let mut table = self.permanent.write().unwrap();
        for (tool, pattern) in rules {
            table.entry(tool.to_ascii_lowercase()).or_default().push(pattern);
        }
    }

    /// Drop session-scoped rules (full reset keeps permanent ones).
    pub fn clear_session(&self) {
        self.session.write().unwrap().clear();
    }
}

/// Generalize an approved action into a reusable rule pattern.
///
/// Shell commands keep only their program word plus an explicit wildcard;
/// file tools widen to the parent directory; everything else stays exact.
pub fn generalize(tool_name: &str, input: &serde_json::Value) -> String {
    let action = action_of(tool_name, input);
    match ToolArgKind::of(tool_name) {
        ToolArgKind::Shell => match shell_words::split(&action) {
            Ok(words) if !words.is_empty() => format!("{} *", words[0]),
            _ => action,
        },
        ToolArgKind::FilePath => Path::new(&action)
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or(action),
        ToolArgKind::Other => action,
    }
}
