//! Session core integration tests
//!
//! End-to-end tests exercising the full facade with an in-memory backend:
//! streaming turns, tool gating through the permission engine, diff
//! capture via the hook pair, plan approval carry-over, and structured
//! question answering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::{
    ApprovalCallback, ApprovalDecision, ApprovalRequest, Attachment, BackendControl,
    BackendEvent, BackendHandle, BackendLauncher, CoreError, GateVerdict, HistoryMessage,
    MessageConsumer, PermissionMode, PlanDecision, PlanDecisionCallback, QueryOptions,
    QuestionCallback, StartOptions, StreamChunk, Tether, ToolGate, ToolInvocation, ToolOutcome,
    ToolProposal, ToolUseHook, UserMessage,
};

// ─── In-memory backend ───────────────────────────────────────────

/// One scripted action the backend performs during a turn.
#[derive(Clone)]
enum Step {
    Text(&'static str),
    /// Propose a tool call through the gate; run it via the hooks when
    /// allowed. A `write` tool actually writes to disk.
    Tool {
        id: &'static str,
        name: &'static str,
        input: Value,
    },
}

struct ScriptedBackend {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    launches: AtomicUsize,
    system_prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            launches: AtomicUsize::new(0),
            system_prompts: Mutex::new(Vec::new()),
        })
    }
}

struct NoopControl;

#[async_trait]
impl BackendControl for NoopControl {
    async fn set_model(&self, _model: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_thinking_budget(&self, _budget: Option<u32>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_permission_mode(&self, _mode: PermissionMode) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_tool_servers(
        &self,
        _servers: &std::collections::BTreeMap<String, tether_core::ToolServerConfig>,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

async fn run_tool_step(
    options: &StartOptions,
    tx: &mpsc::Sender<BackendEvent>,
    id: &str,
    name: &str,
    input: Value,
) {
    let proposal = ToolProposal::classify(id, name, input.clone());
    let verdict = options.gate.evaluate(proposal).await;

    let effective_input = match verdict {
        GateVerdict::Allow { updated_input } => updated_input.unwrap_or(input),
        GateVerdict::Deny { message, .. } => {
            let _ = tx
                .send(BackendEvent::ToolEnd {
                    id: id.to_string(),
                    name: name.to_string(),
                    output: message,
                    is_error: true,
                })
                .await;
            return;
        }
    };

    let invocation = ToolInvocation {
        id: id.to_string(),
        name: name.to_string(),
        input: effective_input.clone(),
    };
    let _ = tx
        .send(BackendEvent::ToolStart {
            id: id.to_string(),
            name: name.to_string(),
            input: effective_input.clone(),
        })
        .await;

    for hook in &options.hooks {
        hook.before_tool(&invocation).await;
    }
    if name == "write" {
        if let (Some(path), Some(content)) = (
            effective_input.get("file_path").and_then(|v| v.as_str()),
            effective_input.get("content").and_then(|v| v.as_str()),
        ) {
            let _ = tokio::fs::write(path, content).await;
        }
    }
    let outcome = ToolOutcome {
        output: "ok".to_string(),
        is_error: false,
    };
    for hook in &options.hooks {
        hook.after_tool(&invocation, &outcome).await;
    }

    let _ = tx
        .send(BackendEvent::ToolEnd {
            id: id.to_string(),
            name: name.to_string(),
            output: outcome.output,
            is_error: false,
        })
        .await;
}

#[async_trait]
impl BackendLauncher for ScriptedBackend {
    async fn launch(
        &self,
        options: StartOptions,
        mut input: MessageConsumer<UserMessage>,
        _cancel: CancellationToken,
    ) -> Result<BackendHandle, CoreError> {
        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.system_prompts
            .lock()
            .unwrap()
            .push(options.system_prompt.clone());

        let scripts: Vec<Vec<Step>> = {
            let mut guard = self.scripts.lock().unwrap();
            guard.drain(..).collect()
        };
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut scripts: VecDeque<_> = scripts.into();
            let mut first = true;
            while let Some(_message) = input.recv().await {
                if first {
                    first = false;
                    let _ = tx
                        .send(BackendEvent::SessionInit {
                            session_id: format!("sess-{}", launch),
                        })
                        .await;
                }
                let steps = scripts.pop_front().unwrap_or_default();
                for step in steps {
                    match step {
                        Step::Text(text) => {
                            let _ = tx
                                .send(BackendEvent::TextDelta {
                                    text: text.to_string(),
                                })
                                .await;
                        }
                        Step::Tool { id, name, input } => {
                            run_tool_step(&options, &tx, id, name, input).await;
                        }
                    }
                }
                let _ = tx
                    .send(BackendEvent::TurnCompleted { stop_reason: None })
                    .await;
            }
        });

        Ok(BackendHandle {
            events: rx,
            control: Arc::new(NoopControl),
        })
    }
}

// ─── Callbacks ───────────────────────────────────────────────────

struct RecordingApproval {
    decision: ApprovalDecision,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl RecordingApproval {
    fn new(decision: ApprovalDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ApprovalCallback for RecordingApproval {
    async fn request_approval(&self, request: ApprovalRequest) -> anyhow::Result<ApprovalDecision> {
        self.requests.lock().unwrap().push(request);
        Ok(self.decision)
    }
}

struct FixedAnswer(Value);

#[async_trait]
impl QuestionCallback for FixedAnswer {
    async fn answer(&self, _questions: Value) -> anyhow::Result<Option<Value>> {
        Ok(Some(self.0.clone()))
    }
}

struct ApprovePlan;

#[async_trait]
impl PlanDecisionCallback for ApprovePlan {
    async fn review_plan(&self, _plan: String) -> anyhow::Result<PlanDecision> {
        Ok(PlanDecision::Approve)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

fn tool_chunks(chunks: &[StreamChunk]) -> Vec<(&str, bool)> {
    chunks
        .iter()
        .filter_map(|chunk| match chunk {
            StreamChunk::ToolEnd { name, is_error, .. } => Some((name.as_str(), *is_error)),
            _ => None,
        })
        .collect()
}

// ─── Streaming & tool gating ─────────────────────────────────────

#[tokio::test]
async fn test_prompted_tool_flow_with_diff_capture() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("note.md");
    tokio::fs::write(&target, "before\n").await.unwrap();

    let backend = ScriptedBackend::new(vec![vec![
        Step::Text("editing"),
        Step::Tool {
            id: "tool-1",
            name: "write",
            input: json!({
                "file_path": target.to_str().unwrap(),
                "content": "before\nafter\n"
            }),
        },
    ]]);

    let tether = Tether::builder()
        .launcher(backend)
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Prompt)
        .build()
        .unwrap();

    let approval = RecordingApproval::new(ApprovalDecision::Allow);
    tether.set_approval_callback(approval.clone());

    let chunks = tether
        .query("edit the note", QueryOptions::default())
        .await
        .collect_all()
        .await;

    assert_eq!(tool_chunks(&chunks), vec![("write", false)]);
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));

    // The approval prompt carried a human-readable description.
    let requests = approval.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].description.contains("write"));
    drop(requests);

    // Diff data is available exactly once.
    let diff = tether.diff_data("tool-1").expect("diff should exist");
    assert_eq!(diff.original, "before\n");
    assert!(diff.diff.contains("+after"));
    assert!(tether.diff_data("tool-1").is_none());
}

#[tokio::test]
async fn test_denied_tool_reported_as_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![vec![Step::Tool {
        id: "tool-1",
        name: "bash",
        input: json!({"command": "rm -rf /"}),
    }]]);

    let tether = Tether::builder()
        .launcher(backend)
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Prompt)
        .build()
        .unwrap();
    tether.set_approval_callback(RecordingApproval::new(ApprovalDecision::Deny));

    let chunks = tether
        .query("clean up", QueryOptions::default())
        .await
        .collect_all()
        .await;

    assert_eq!(tool_chunks(&chunks), vec![("bash", true)]);
    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
}

#[tokio::test]
async fn test_auto_mode_runs_tools_without_callback() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![vec![Step::Tool {
        id: "tool-1",
        name: "bash",
        input: json!({"command": "cargo check"}),
    }]]);

    let tether = Tether::builder()
        .launcher(backend)
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Auto)
        .build()
        .unwrap();

    let chunks = tether
        .query("check it", QueryOptions::default())
        .await
        .collect_all()
        .await;

    assert_eq!(tool_chunks(&chunks), vec![("bash", false)]);
}

// ─── Structured questions ────────────────────────────────────────

#[tokio::test]
async fn test_question_answers_flow_into_tool_input() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![vec![Step::Tool {
        id: "q-1",
        name: "AskUserQuestion",
        input: json!({"question": "which color?"}),
    }]]);

    let tether = Tether::builder()
        .launcher(backend)
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Prompt)
        .build()
        .unwrap();
    tether.set_question_callback(Arc::new(FixedAnswer(json!({"choice": "blue"}))));

    let chunks = tether
        .query("ask me", QueryOptions::default())
        .await
        .collect_all()
        .await;

    // The backend saw the merged input on the tool start chunk.
    let merged = chunks.iter().find_map(|chunk| match chunk {
        StreamChunk::ToolStart { input, .. } => Some(input.clone()),
        _ => None,
    });
    let merged = merged.expect("question tool should have started");
    assert_eq!(merged["question"], "which color?");
    assert_eq!(merged["choice"], "blue");

    // Answers are retrievable once by invocation id.
    assert_eq!(
        tether.question_answers("q-1"),
        Some(json!({"choice": "blue"}))
    );
    assert_eq!(tether.question_answers("q-1"), None);
}

// ─── Plan approval carry-over ────────────────────────────────────

#[tokio::test]
async fn test_approved_plan_reaches_next_system_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![
        vec![Step::Tool {
            id: "p-1",
            name: "exit_plan_mode",
            input: json!({"plan": "1. rename module\n2. fix imports"}),
        }],
        vec![Step::Text("implementing")],
    ]);

    let tether = Tether::builder()
        .launcher(backend.clone())
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Plan)
        .plans_dir(dir.path().join("plans"))
        .build()
        .unwrap();
    tether.set_plan_decision_callback(Arc::new(ApprovePlan));

    let chunks = tether
        .query("plan the refactor", QueryOptions::default())
        .await
        .collect_all()
        .await;
    // The exit-plan tool is denied with an interrupt message so the
    // backend does not keep running in restricted mode.
    assert_eq!(tool_chunks(&chunks), vec![("exit_plan_mode", true)]);

    tether.set_permission_mode(PermissionMode::Auto).await;
    tether
        .query("implement the plan", QueryOptions::default())
        .await
        .collect_all()
        .await;

    // The changed system prompt forced a restart carrying the plan.
    assert_eq!(backend.launches.load(Ordering::SeqCst), 2);
    let prompts = backend.system_prompts.lock().unwrap();
    assert!(prompts[0].is_empty());
    assert!(prompts[1].contains("Approved plan:"));
    assert!(prompts[1].contains("rename module"));
}

// ─── History rebuild ─────────────────────────────────────────────

#[tokio::test]
async fn test_history_folds_into_first_turn_of_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![vec![Step::Text("hi again")]]);

    let tether = Tether::builder()
        .launcher(backend)
        .workspace(dir.path())
        .model("sonnet")
        .permission_mode(PermissionMode::Auto)
        .build()
        .unwrap();

    let options = QueryOptions {
        attachments: vec![Attachment::File {
            path: "notes.md".into(),
        }],
        history: vec![HistoryMessage::user("earlier question")],
    };
    let chunks = tether.query("continue", options).await.collect_all().await;

    assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
    assert!(tether.session_id().is_some());
}
