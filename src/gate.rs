//! Tool permission engine
//!
//! Every tool invocation the backend proposes passes through one gate
//! call and must receive a verdict before the backend proceeds. Three
//! interactive tools are special-cased (structured question, enter plan
//! mode, exit plan mode); everything else runs the approval decision flow
//! for the current permission mode, consulting session-scoped and
//! permanent allow rules first.
//!
//! External callbacks may suspend indefinitely (a human is usually on the
//! other end); the gate itself is plain state transition logic once the
//! answer arrives. Callback failures always become a deny verdict, never
//! an unhandled fault: an unanswered tool call would stall the backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::plan::PlanTracker;
use crate::rules::{self, RuleBook, RuleScope, ToolArgKind};
use crate::settings::PermissionMode;

/// A proposed tool call, classified so the interactive special cases are
/// checked exhaustively by the type system.
#[derive(Debug, Clone)]
pub enum ToolProposal {
    /// Structured multiple-choice question for the user
    Question { id: String, input: Value },
    /// Request to activate plan mode on the next turn
    EnterPlan { id: String, input: Value },
    /// Request to leave plan mode with a finished plan
    ExitPlan { id: String, input: Value },
    /// Any ordinary tool
    Generic {
        id: String,
        name: String,
        input: Value,
    },
}

impl ToolProposal {
    /// Classify a raw tool call by name.
    pub fn classify(id: impl Into<String>, name: &str, input: Value) -> Self {
        let id = id.into();
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "askuserquestion" => ToolProposal::Question { id, input },
            "enterplanmode" => ToolProposal::EnterPlan { id, input },
            "exitplanmode" => ToolProposal::ExitPlan { id, input },
            _ => ToolProposal::Generic {
                id,
                name: name.to_string(),
                input,
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ToolProposal::Question { id, .. }
            | ToolProposal::EnterPlan { id, .. }
            | ToolProposal::ExitPlan { id, .. }
            | ToolProposal::Generic { id, .. } => id,
        }
    }
}

/// Gate decision for one proposed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    /// Proceed, optionally with rewritten input
    Allow { updated_input: Option<Value> },
    /// Refuse. `interrupt` additionally requests that the stream stop:
    /// a user-initiated abort is kept distinct from a plain refusal.
    Deny { message: String, interrupt: bool },
}

impl GateVerdict {
    pub fn allow() -> Self {
        GateVerdict::Allow {
            updated_input: None,
        }
    }

    pub fn allow_with(input: Value) -> Self {
        GateVerdict::Allow {
            updated_input: Some(input),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        GateVerdict::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    pub fn deny_interrupt(message: impl Into<String>) -> Self {
        GateVerdict::Deny {
            message: message.into(),
            interrupt: true,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, GateVerdict::Allow { .. })
    }
}

/// The seam the backend calls once per proposed tool invocation.
#[async_trait]
pub trait ToolGate: Send + Sync {
    async fn evaluate(&self, proposal: ToolProposal) -> GateVerdict;
}

/// Host decision for a per-action approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    /// Allow and remember a generalized rule permanently
    AllowAlways,
    Deny,
    /// User escaped/aborted rather than explicitly denying
    Cancel,
}

/// What the host shows the user for a per-action prompt.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub input: Value,
    /// Human-readable rendering of the action
    pub description: String,
}

/// Host decision after reviewing a finished plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Implement the plan in a fresh, unrestricted turn
    Approve,
    /// Implement the plan in a brand-new session
    ApproveNewSession,
    /// Keep planning, with feedback for the agent
    Revise { feedback: String },
    Cancel,
}

#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> Result<ApprovalDecision>;
}

#[async_trait]
pub trait QuestionCallback: Send + Sync {
    /// Present a structured question. `None` means the user dismissed it.
    async fn answer(&self, questions: Value) -> Result<Option<Value>>;
}

#[async_trait]
pub trait PlanEntryCallback: Send + Sync {
    /// Plan mode should activate on the next turn. Best-effort.
    async fn plan_mode_requested(&self) -> Result<()>;
}

#[async_trait]
pub trait PlanDecisionCallback: Send + Sync {
    async fn review_plan(&self, plan: String) -> Result<PlanDecision>;
}

/// Persists permanent allow rules to the project settings store.
#[async_trait]
pub trait RuleSink: Send + Sync {
    async fn persist_allow_rule(&self, tool_name: &str, pattern: &str) -> Result<()>;
}

/// The permission engine gating every proposed tool call.
pub struct PermissionEngine {
    mode: RwLock<PermissionMode>,
    rules: RuleBook,
    plan: Arc<PlanTracker>,
    approval: RwLock<Option<Arc<dyn ApprovalCallback>>>,
    question: RwLock<Option<Arc<dyn QuestionCallback>>>,
    plan_entry: RwLock<Option<Arc<dyn PlanEntryCallback>>>,
    plan_decision: RwLock<Option<Arc<dyn PlanDecisionCallback>>>,
    rule_sink: RwLock<Option<Arc<dyn RuleSink>>>,
    /// Question answers by tool invocation id, consumed on first read
    answers: RwLock<HashMap<String, Value>>,
}

impl PermissionEngine {
    pub fn new(plan: Arc<PlanTracker>) -> Self {
        Self {
            mode: RwLock::new(PermissionMode::default()),
            rules: RuleBook::new(),
            plan,
            approval: RwLock::new(None),
            question: RwLock::new(None),
            plan_entry: RwLock::new(None),
            plan_decision: RwLock::new(None),
            rule_sink: RwLock::new(None),
            answers: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.write().unwrap() = mode;
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.read().unwrap()
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn set_approval_callback(&self, callback: Arc<dyn ApprovalCallback>) {
        *self.approval.write().unwrap() = Some(callback);
    }

    pub fn set_question_callback(&self, callback: Arc<dyn QuestionCallback>) {
        *self.question.write().unwrap() = Some(callback);
    }

    pub fn set_plan_entry_callback(&self, callback: Arc<dyn PlanEntryCallback>) {
        *self.plan_entry.write().unwrap() = Some(callback);
    }

    pub fn set_plan_decision_callback(&self, callback: Arc<dyn PlanDecisionCallback>) {
        *self.plan_decision.write().unwrap() = Some(callback);
    }

    pub fn set_rule_sink(&self, sink: Arc<dyn RuleSink>) {
        *self.rule_sink.write().unwrap() = Some(sink);
    }

    /// Consume cached answers for a question invocation (read-once).
    pub fn take_answers(&self, invocation_id: &str) -> Option<Value> {
        self.answers.write().unwrap().remove(invocation_id)
    }

    async fn evaluate_question(&self, id: &str, input: Value) -> GateVerdict {
        let callback = self.question.read().unwrap().clone();
        let Some(callback) = callback else {
            return GateVerdict::deny("No interactive question handler is available.");
        };

        match callback.answer(input.clone()).await {
            Ok(Some(answers)) => {
                self.answers
                    .write()
                    .unwrap()
                    .insert(id.to_string(), answers.clone());
                GateVerdict::allow_with(merge_answers(input, answers))
            }
            Ok(None) => GateVerdict::deny_interrupt("The user dismissed the question."),
            Err(error) => {
                tracing::warn!(%error, "question handler failed");
                GateVerdict::deny("The question could not be presented.")
            }
        }
    }

    async fn evaluate_enter_plan(&self) -> GateVerdict {
        // Notification is best-effort: the host can also infer plan mode
        // from the stream, so a missing or failing callback is non-fatal.
        let callback = self.plan_entry.read().unwrap().clone();
        if let Some(callback) = callback {
            if let Err(error) = callback.plan_mode_requested().await {
                tracing::warn!(%error, "plan entry notification failed");
            }
        }
        GateVerdict::allow()
    }

    async fn evaluate_exit_plan(&self, input: &Value) -> GateVerdict {
        let fallback = input.get("plan").and_then(|v| v.as_str());
        let plan_text = self
            .plan
            .read_current(fallback)
            .await
            .unwrap_or_default();

        let callback = self.plan_decision.read().unwrap().clone();
        let Some(callback) = callback else {
            return GateVerdict::deny_interrupt("No plan review handler is available.");
        };

        match callback.review_plan(plan_text.clone()).await {
            Ok(PlanDecision::Approve) => {
                self.plan.approve(plan_text);
                // Deny, deliberately: the backend must not keep running in
                // restricted plan mode. The host starts a fresh turn.
                GateVerdict::deny_interrupt(
                    "Plan approved. Start a new turn without plan restrictions and implement it.",
                )
            }
            Ok(PlanDecision::ApproveNewSession) => {
                self.plan.approve(plan_text);
                GateVerdict::deny_interrupt(
                    "Plan approved. Start a brand-new session and implement it there.",
                )
            }
            Ok(PlanDecision::Revise { feedback }) => GateVerdict::deny(format!(
                "The user wants the plan revised before leaving plan mode: {}",
                feedback
            )),
            Ok(PlanDecision::Cancel) => {
                GateVerdict::deny_interrupt("Plan mode exit cancelled by the user.")
            }
            Err(error) => {
                tracing::warn!(%error, "plan review handler failed");
                GateVerdict::deny_interrupt("Plan review failed.")
            }
        }
    }

    async fn evaluate_generic(&self, name: &str, input: Value) -> GateVerdict {
        if is_file_writing_tool(name) {
            let action = rules::action_of(name, &input);
            if !action.is_empty() {
                self.plan.note_write(Path::new(&action));
            }
        }

        match self.mode() {
            PermissionMode::Auto => GateVerdict::allow(),
            PermissionMode::Prompt | PermissionMode::Plan => {
                self.prompted_verdict(name, input).await
            }
        }
    }

    async fn prompted_verdict(&self, name: &str, input: Value) -> GateVerdict {
        if self.rules.is_pre_approved(name, &input) {
            tracing::debug!(tool = name, "pre-approved by stored rule");
            return GateVerdict::allow();
        }

        let callback = self.approval.read().unwrap().clone();
        let Some(callback) = callback else {
            return GateVerdict::deny("No approval handler is configured.");
        };

        let request = ApprovalRequest {
            tool_name: name.to_string(),
            input: input.clone(),
            description: describe_action(name, &input),
        };

        match callback.request_approval(request).await {
            Ok(ApprovalDecision::Allow) => GateVerdict::allow(),
            Ok(ApprovalDecision::AllowAlways) => {
                let pattern = rules::generalize(name, &input);
                self.rules.add(RuleScope::Permanent, name, pattern.clone());
                let sink = self.rule_sink.read().unwrap().clone();
                if let Some(sink) = sink {
                    if let Err(error) = sink.persist_allow_rule(name, &pattern).await {
                        tracing::warn!(%error, tool = name, "failed to persist allow rule");
                    }
                }
                GateVerdict::allow()
            }
            Ok(ApprovalDecision::Deny) => GateVerdict::deny("The user denied this action."),
            Ok(ApprovalDecision::Cancel) => {
                GateVerdict::deny_interrupt("The user aborted this action.")
            }
            Err(error) => {
                tracing::warn!(%error, tool = name, "approval handler failed");
                GateVerdict::deny_interrupt("Approval could not be obtained.")
            }
        }
    }
}

#[async_trait]
impl ToolGate for PermissionEngine {
    async fn evaluate(&self, proposal: ToolProposal) -> GateVerdict {
        match proposal {
            ToolProposal::Question { id, input } => self.evaluate_question(&id, input).await,
            ToolProposal::EnterPlan { .. } => self.evaluate_enter_plan().await,
            ToolProposal::ExitPlan { input, .. } => self.evaluate_exit_plan(&input).await,
            ToolProposal::Generic { name, input, .. } => {
                self.evaluate_generic(&name, input).await
            }
        }
    }
}

fn is_file_writing_tool(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "write" | "edit" | "multi_edit" | "patch"
    )
}

/// Merge question answers into the tool input.
fn merge_answers(input: Value, answers: Value) -> Value {
    match (input, &answers) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
            Value::Object(base)
        }
        (other, _) => {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("input".to_string(), other);
            wrapper.insert("answers".to_string(), answers);
            Value::Object(wrapper)
        }
    }
}

/// Human-readable rendering of an action for the approval prompt.
fn describe_action(name: &str, input: &Value) -> String {
    match ToolArgKind::of(name) {
        ToolArgKind::Shell => {
            let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
            format!("Run command: {}", command)
        }
        ToolArgKind::FilePath => {
            let path = rules::action_of(name, input);
            format!("{} {}", name, path)
        }
        ToolArgKind::Other => {
            let compact = serde_json::to_string(input).unwrap_or_default();
            format!("{} {}", name, compact)
        }
    }
}
