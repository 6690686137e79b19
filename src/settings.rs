//! Connection settings and restart/update reconciliation
//!
//! The full settings record travels with every start; the
//! [`ConnectionSnapshot`] is the restart-relevant subset compared
//! field-by-field on every turn. A changed field triggers the minimal
//! corrective action: a cheap in-place setter where the backend supports
//! one, a full connection restart otherwise.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tool gating mode for the backend and the permission engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Every side-effecting tool is allowed without asking
    Auto,
    /// Every non-pre-approved action prompts the host
    #[default]
    Prompt,
    /// The agent must propose a plan before side effects are permitted
    Plan,
}

/// Configuration for one external tool server available to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Everything needed to start and drive the backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Path to the agent backend executable. Must exist when set.
    pub cli_path: Option<PathBuf>,
    /// Working directory the agent operates in. Must exist.
    pub workspace: PathBuf,
    pub model: String,
    pub thinking_budget: Option<u32>,
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Settings sources the backend may read (project, user, ...).
    #[serde(default)]
    pub settings_sources: Vec<String>,
    /// Session to resume, when one is known.
    #[serde(default)]
    pub resume_session_id: Option<String>,
}

impl ConnectionSettings {
    pub fn new(workspace: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            cli_path: None,
            workspace: workspace.into(),
            model: model.into(),
            thinking_budget: None,
            permission_mode: PermissionMode::default(),
            system_prompt: String::new(),
            disallowed_tools: Vec::new(),
            tool_servers: BTreeMap::new(),
            allowed_paths: Vec::new(),
            env: HashMap::new(),
            settings_sources: Vec::new(),
            resume_session_id: None,
        }
    }

    pub fn with_cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cli_path = Some(path.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_thinking_budget(mut self, tokens: u32) -> Self {
        self.thinking_budget = Some(tokens);
        self
    }

    pub fn with_tool_server(
        mut self,
        name: impl Into<String>,
        config: ToolServerConfig,
    ) -> Self {
        self.tool_servers.insert(name.into(), config);
        self
    }
}

/// Restart-relevant subset of the settings, hashed where the raw content
/// is large. Compared field-by-field on every turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub model: String,
    pub thinking_budget: Option<u32>,
    pub permission_mode: PermissionMode,
    pub system_prompt_hash: u64,
    pub disallowed_tools_hash: u64,
    pub tool_servers_hash: u64,
    pub allowed_paths: Vec<PathBuf>,
    pub cli_path: Option<PathBuf>,
}

fn content_hash(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl ConnectionSnapshot {
    pub fn of(settings: &ConnectionSettings) -> Self {
        // BTreeMap keeps server order deterministic, so the serialized
        // form is a stable hash input.
        let servers = serde_json::to_string(&settings.tool_servers).unwrap_or_default();
        Self {
            model: settings.model.clone(),
            thinking_budget: settings.thinking_budget,
            permission_mode: settings.permission_mode,
            system_prompt_hash: content_hash(&settings.system_prompt),
            disallowed_tools_hash: content_hash(&settings.disallowed_tools),
            tool_servers_hash: content_hash(&servers),
            allowed_paths: settings.allowed_paths.clone(),
            cli_path: settings.cli_path.clone(),
        }
    }

    /// Field-by-field comparison against the next snapshot.
    pub fn delta(&self, next: &ConnectionSnapshot) -> SnapshotDelta {
        SnapshotDelta {
            model_changed: self.model != next.model,
            thinking_budget_changed: self.thinking_budget != next.thinking_budget,
            permission_mode_changed: self.permission_mode != next.permission_mode,
            tool_servers_changed: self.tool_servers_hash != next.tool_servers_hash,
            system_prompt_changed: self.system_prompt_hash != next.system_prompt_hash,
            disallowed_tools_changed: self.disallowed_tools_hash != next.disallowed_tools_hash,
            allowed_paths_changed: self.allowed_paths != next.allowed_paths,
            cli_path_changed: self.cli_path != next.cli_path,
        }
    }
}

/// Outcome of comparing two snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotDelta {
    // Cheap in-place updates
    pub model_changed: bool,
    pub thinking_budget_changed: bool,
    pub permission_mode_changed: bool,
    pub tool_servers_changed: bool,
    // Restart-only fields: the backend has no setter for these
    pub system_prompt_changed: bool,
    pub disallowed_tools_changed: bool,
    pub allowed_paths_changed: bool,
    pub cli_path_changed: bool,
}

impl SnapshotDelta {
    pub fn is_empty(&self) -> bool {
        !self.requires_restart()
            && !self.model_changed
            && !self.thinking_budget_changed
            && !self.permission_mode_changed
            && !self.tool_servers_changed
    }

    /// Whether any changed field has no in-place setter.
    pub fn requires_restart(&self) -> bool {
        self.system_prompt_changed
            || self.disallowed_tools_changed
            || self.allowed_paths_changed
            || self.cli_path_changed
    }
}
