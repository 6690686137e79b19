//! Opaque backend connection seam
//!
//! The agent backend is an external collaborator: an append-only input
//! sequence of user turns in, a stream of typed events out, plus a handful
//! of in-place configuration setters and a best-effort interrupt. Hosts
//! supply a [`BackendLauncher`]; the core never assumes anything about
//! what runs on the other side.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::MessageConsumer;
use crate::chunk::UserMessage;
use crate::error::CoreError;
use crate::gate::ToolGate;
use crate::settings::{ConnectionSettings, PermissionMode, ToolServerConfig};

/// Typed events emitted by the backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendEvent {
    /// The backend opened (or resumed) a session and reports its id
    #[serde(rename = "session_init")]
    SessionInit { session_id: String },

    /// Assistant text delta
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    /// Extended thinking delta
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    /// Tool invocation started
    #[serde(rename = "tool_start")]
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool invocation finished
    #[serde(rename = "tool_end")]
    ToolEnd {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// Token usage report
    #[serde(rename = "usage")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// The current turn completed
    #[serde(rename = "turn_completed")]
    TurnCompleted { stop_reason: Option<String> },

    /// Connection-level failure
    #[serde(rename = "error")]
    Error { message: String },
}

/// A proposed tool invocation, as seen by lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolInvocation {
    /// File path targeted by this invocation, when the tool edits files.
    pub fn file_path(&self) -> Option<&str> {
        let name = self.name.to_ascii_lowercase();
        if !matches!(name.as_str(), "write" | "edit" | "multi_edit" | "patch") {
            return None;
        }
        self.input
            .get("file_path")
            .or_else(|| self.input.get("path"))
            .and_then(|v| v.as_str())
    }
}

/// Result of a finished tool invocation, as seen by lifecycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
}

/// Pre/post tool-execution observer registered with the backend.
#[async_trait]
pub trait ToolUseHook: Send + Sync {
    /// Called before the tool runs, after the gate allowed it.
    async fn before_tool(&self, invocation: &ToolInvocation);

    /// Called after the tool ran.
    async fn after_tool(&self, invocation: &ToolInvocation, outcome: &ToolOutcome);
}

/// Options handed to the launcher when the connection starts.
#[derive(Clone)]
pub struct StartOptions {
    pub workspace: PathBuf,
    pub cli_path: Option<PathBuf>,
    pub model: String,
    pub thinking_budget: Option<u32>,
    pub permission_mode: PermissionMode,
    pub system_prompt: String,
    pub disallowed_tools: Vec<String>,
    pub tool_servers: BTreeMap<String, ToolServerConfig>,
    pub allowed_paths: Vec<PathBuf>,
    pub env: HashMap<String, String>,
    pub settings_sources: Vec<String>,
    pub resume_session_id: Option<String>,
    /// Gate the backend must consult before every tool invocation.
    pub gate: Arc<dyn ToolGate>,
    /// Hook registrations for tool lifecycle observation.
    pub hooks: Vec<Arc<dyn ToolUseHook>>,
}

impl std::fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartOptions")
            .field("workspace", &self.workspace)
            .field("cli_path", &self.cli_path)
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("resume_session_id", &self.resume_session_id)
            .field("tool_servers", &self.tool_servers.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl StartOptions {
    pub fn from_settings(
        settings: &ConnectionSettings,
        gate: Arc<dyn ToolGate>,
        hooks: Vec<Arc<dyn ToolUseHook>>,
    ) -> Self {
        Self {
            workspace: settings.workspace.clone(),
            cli_path: settings.cli_path.clone(),
            model: settings.model.clone(),
            thinking_budget: settings.thinking_budget,
            permission_mode: settings.permission_mode,
            system_prompt: settings.system_prompt.clone(),
            disallowed_tools: settings.disallowed_tools.clone(),
            tool_servers: settings.tool_servers.clone(),
            allowed_paths: settings.allowed_paths.clone(),
            env: settings.env.clone(),
            settings_sources: settings.settings_sources.clone(),
            resume_session_id: settings.resume_session_id.clone(),
            gate,
            hooks,
        }
    }
}

/// Control half of a live connection: in-place setters and interrupt.
#[async_trait]
pub trait BackendControl: Send + Sync {
    async fn set_model(&self, model: &str) -> Result<(), CoreError>;

    async fn set_thinking_budget(&self, budget: Option<u32>) -> Result<(), CoreError>;

    async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), CoreError>;

    async fn set_tool_servers(
        &self,
        servers: &BTreeMap<String, ToolServerConfig>,
    ) -> Result<(), CoreError>;

    /// Best-effort interruption of the in-flight turn.
    async fn interrupt(&self) -> Result<(), CoreError>;
}

/// A live backend connection: its event stream plus its control handle.
pub struct BackendHandle {
    pub events: mpsc::Receiver<BackendEvent>,
    pub control: Arc<dyn BackendControl>,
}

/// Factory for live connections, supplied by the host.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Start the backend. `input` is the continuous sequence of user
    /// turns; `cancel` is signalled when the host wants output to stop.
    async fn launch(
        &self,
        options: StartOptions,
        input: MessageConsumer<UserMessage>,
        cancel: CancellationToken,
    ) -> Result<BackendHandle, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_extraction() {
        let invocation = ToolInvocation {
            id: "t1".into(),
            name: "write".into(),
            input: serde_json::json!({"file_path": "/ws/a.rs", "content": "x"}),
        };
        assert_eq!(invocation.file_path(), Some("/ws/a.rs"));

        let shell = ToolInvocation {
            id: "t2".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        assert_eq!(shell.file_path(), None);
    }

    #[test]
    fn test_file_path_accepts_path_field() {
        let invocation = ToolInvocation {
            id: "t1".into(),
            name: "Edit".into(),
            input: serde_json::json!({"path": "/ws/b.rs"}),
        };
        assert_eq!(invocation.file_path(), Some("/ws/b.rs"));
    }

    #[test]
    fn test_backend_event_serialization_tag() {
        let event = BackendEvent::SessionInit {
            session_id: "s".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_init");
    }
}
