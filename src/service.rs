//! Host-facing facade
//!
//! Wraps the connection manager, session state, permission engine, diff
//! store, and plan tracker behind one object built with
//! [`Tether::builder()`]. Per-turn failures never throw across this
//! boundary: `query` always returns a chunk stream, and a terminal
//! `error` chunk carries any failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::backend::{BackendLauncher, ToolUseHook};
use crate::chunk::{history_recap, Attachment, HistoryMessage};
use crate::connection::ConnectionManager;
use crate::diff_store::{DiffData, DiffRecorder, DiffStore};
use crate::gate::{
    ApprovalCallback, PermissionEngine, PlanDecisionCallback, PlanEntryCallback,
    QuestionCallback, RuleSink, ToolGate,
};
use crate::plan::PlanTracker;
use crate::router::{ResponseRouter, TurnStream};
use crate::session::SessionState;
use crate::settings::{ConnectionSettings, PermissionMode};

/// Options for one `query` call.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub attachments: Vec<Attachment>,
    /// Prior conversation, used to rebuild context when no trustworthy
    /// backend session exists (fresh start or after an interruption).
    pub history: Vec<HistoryMessage>,
}

/// The embedded agent session core.
///
/// One `Tether` drives one conversation at a time; a host needing
/// concurrent conversations runs one per session.
pub struct Tether {
    settings: RwLock<ConnectionSettings>,
    connection: Arc<ConnectionManager>,
    session: Arc<SessionState>,
    engine: Arc<PermissionEngine>,
    diffs: Arc<DiffStore>,
    plan: Arc<PlanTracker>,
}

impl std::fmt::Debug for Tether {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tether")
            .field("session_id", &self.session.session_id())
            .finish()
    }
}

impl Tether {
    pub fn builder() -> TetherBuilder {
        TetherBuilder::new()
    }

    /// Submit a user turn and stream its chunks.
    ///
    /// The returned sequence is always terminated by a `done` or `error`
    /// chunk; configuration problems abort before the connection is
    /// touched and surface as an immediate `error` chunk.
    pub async fn query(&self, prompt: &str, options: QueryOptions) -> TurnStream {
        // Fold newly approved plan content into the system prompt. The
        // changed prompt hash forces a restart, which is exactly the
        // fresh unrestricted turn plan approval asks for.
        if let Some(plan) = self.plan.take_approved() {
            let mut settings = self.settings.write().await;
            if !settings.system_prompt.is_empty() {
                settings.system_prompt.push_str("\n\n");
            }
            settings.system_prompt.push_str("Approved plan:\n");
            settings.system_prompt.push_str(&plan);
        }

        if self.session.was_interrupted() {
            // The backend session diverged from what the user saw; drop it
            // and rebuild conversational context from history instead.
            self.session.clear_interrupted();
            self.session.invalidate();
        }

        let mut settings = self.settings.read().await.clone();
        settings.resume_session_id = self.session.session_id();
        self.engine.set_mode(settings.permission_mode);

        let recap = if settings.resume_session_id.is_none() {
            history_recap(&options.history)
        } else {
            None
        };

        self.session.stage_model(settings.model.clone());
        self.diffs.begin_turn();

        if let Err(error) = self.connection.ensure_started(&settings).await {
            return TurnStream::immediate_error(error.to_string());
        }
        match self
            .connection
            .submit_turn(&settings, prompt, &options.attachments, recap)
            .await
        {
            Ok(stream) => stream,
            Err(error) => TurnStream::immediate_error(error.to_string()),
        }
    }

    /// Interrupt the in-flight turn. Never fails; the affected stream
    /// resolves via normal completion.
    pub async fn cancel(&self) {
        self.connection.cancel_active().await;
    }

    /// Forget the current session and all session-scoped state.
    pub async fn reset_session(&self) {
        self.session.reset();
        self.engine.rules().clear_session();
        self.plan.clear();
        self.connection.close("session reset").await;
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    /// Adopt a session id without touching the connection.
    pub fn set_session_id(&self, id: &str) {
        self.session.switch(id);
    }

    /// Switch to another session; the next turn resumes it on a fresh
    /// connection.
    pub async fn switch_session(&self, id: &str) {
        self.session.switch(id);
        self.connection.close("session switch").await;
    }

    pub fn was_interrupted(&self) -> bool {
        self.session.was_interrupted()
    }

    /// Consume diff data for a tool invocation (read-once).
    pub fn diff_data(&self, invocation_id: &str) -> Option<DiffData> {
        self.diffs.take(invocation_id)
    }

    /// Consume cached structured-question answers (read-once).
    pub fn question_answers(&self, invocation_id: &str) -> Option<serde_json::Value> {
        self.engine.take_answers(invocation_id)
    }

    // ========================================================================
    // Callback wiring
    // ========================================================================

    pub fn set_approval_callback(&self, callback: Arc<dyn ApprovalCallback>) {
        self.engine.set_approval_callback(callback);
    }

    pub fn set_question_callback(&self, callback: Arc<dyn QuestionCallback>) {
        self.engine.set_question_callback(callback);
    }

    pub fn set_plan_entry_callback(&self, callback: Arc<dyn PlanEntryCallback>) {
        self.engine.set_plan_entry_callback(callback);
    }

    pub fn set_plan_decision_callback(&self, callback: Arc<dyn PlanDecisionCallback>) {
        self.engine.set_plan_decision_callback(callback);
    }

    pub fn set_rule_sink(&self, sink: Arc<dyn RuleSink>) {
        self.engine.set_rule_sink(sink);
    }

    /// Load permanent allow rules from the project settings store.
    pub fn load_permanent_rules(&self, rules: impl IntoIterator<Item = (String, String)>) {
        self.engine.rules().load_permanent(rules);
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn set_model(&self, model: impl Into<String>) {
        self.settings.write().await.model = model.into();
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) {
        self.settings.write().await.permission_mode = mode;
        self.engine.set_mode(mode);
    }

    pub async fn set_thinking_budget(&self, budget: Option<u32>) {
        self.settings.write().await.thinking_budget = budget;
    }

    pub async fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.settings.write().await.system_prompt = prompt.into();
    }

    /// Full teardown. Pending callers resolve; the next query starts a
    /// fresh connection.
    pub async fn cleanup(&self) {
        self.connection.close("cleanup").await;
    }
}

/// Builder for [`Tether`].
pub struct TetherBuilder {
    launcher: Option<Arc<dyn BackendLauncher>>,
    settings: Option<ConnectionSettings>,
    workspace: Option<PathBuf>,
    model: Option<String>,
    cli_path: Option<PathBuf>,
    system_prompt: Option<String>,
    permission_mode: Option<PermissionMode>,
    plans_dir: Option<PathBuf>,
    extra_hooks: Vec<Arc<dyn ToolUseHook>>,
}

impl TetherBuilder {
    fn new() -> Self {
        Self {
            launcher: None,
            settings: None,
            workspace: None,
            model: None,
            cli_path: None,
            system_prompt: None,
            permission_mode: None,
            plans_dir: None,
            extra_hooks: Vec::new(),
        }
    }

    pub fn launcher(mut self, launcher: Arc<dyn BackendLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use a fully prepared settings record instead of the field setters.
    pub fn settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace = Some(path.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cli_path = Some(path.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = Some(mode);
        self
    }

    pub fn plans_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plans_dir = Some(dir.into());
        self
    }

    /// Register an additional tool lifecycle hook.
    pub fn hook(mut self, hook: Arc<dyn ToolUseHook>) -> Self {
        self.extra_hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<Tether> {
        let launcher = self.launcher.context("a backend launcher is required")?;

        let mut settings = match self.settings {
            Some(settings) => settings,
            None => {
                let workspace = self.workspace.context("a workspace directory is required")?;
                let model = self.model.context("a model is required")?;
                ConnectionSettings::new(workspace, model)
            }
        };
        if let Some(cli_path) = self.cli_path {
            settings.cli_path = Some(cli_path);
        }
        if let Some(prompt) = self.system_prompt {
            settings.system_prompt = prompt;
        }
        if let Some(mode) = self.permission_mode {
            settings.permission_mode = mode;
        }

        let session = Arc::new(SessionState::new());
        let router = Arc::new(ResponseRouter::new(Arc::clone(&session)));
        let diffs = Arc::new(DiffStore::new());
        let plan = Arc::new(match self.plans_dir {
            Some(dir) => PlanTracker::with_dir(dir),
            None => PlanTracker::new(),
        });

        let engine = Arc::new(PermissionEngine::new(Arc::clone(&plan)));
        engine.set_mode(settings.permission_mode);

        let mut hooks: Vec<Arc<dyn ToolUseHook>> =
            vec![Arc::new(DiffRecorder::new(Arc::clone(&diffs)))];
        hooks.extend(self.extra_hooks);

        let gate: Arc<dyn ToolGate> = Arc::clone(&engine) as Arc<dyn ToolGate>;
        let connection = Arc::new(ConnectionManager::new(
            launcher,
            Arc::clone(&session),
            Arc::clone(&router),
            gate,
            hooks,
        ));

        Ok(Tether {
            settings: RwLock::new(settings),
            connection,
            session,
            engine,
            diffs,
            plan,
        })
    }
}
