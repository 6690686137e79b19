//! Edit diff capture keyed by tool invocation
//!
//! A pre-hook snapshots the original file content (once per file per
//! turn), a post-hook computes the unified diff, and the caller retrieves
//! the result exactly once. A second read for the same invocation id
//! returns nothing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

use crate::backend::{ToolInvocation, ToolOutcome, ToolUseHook};

/// Finalized diff data for one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffData {
    /// File the edit targeted
    pub path: String,
    /// Content captured before the edit
    pub original: String,
    /// Unified diff from original to edited content
    pub diff: String,
    /// When the diff was finalized
    pub timestamp: DateTime<Utc>,
}

/// Side-table of originals and pending diffs.
///
/// The originals table is scoped to one turn; the pending table holds
/// finalized diffs until the caller consumes them.
#[derive(Debug, Default)]
pub struct DiffStore {
    originals: RwLock<HashMap<String, String>>,
    pending: RwLock<HashMap<String, DiffData>>,
}

impl DiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the per-turn originals table. Pending diffs survive until
    /// read, since the caller retrieves them after the turn ends.
    pub fn begin_turn(&self) {
        self.originals.write().unwrap().clear();
    }

    /// Capture a file's pre-edit content. Only the first capture per file
    /// per turn sticks, so multi-edit turns diff against the true original.
    pub fn capture_original(&self, path: &str, content: String) {
        self.originals
            .write()
            .unwrap()
            .entry(path.to_string())
            .or_insert(content);
    }

    /// Compute and store the diff for a finished edit.
    pub fn finalize(&self, invocation_id: &str, path: &str, updated: &str) {
        let original = self
            .originals
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();

        let diff = unified_diff(&original, updated, path);
        self.pending.write().unwrap().insert(
            invocation_id.to_string(),
            DiffData {
                path: path.to_string(),
                original,
                diff,
                timestamp: Utc::now(),
            },
        );
    }

    /// Consume the diff for an invocation. Read-once: the second call for
    /// the same id returns `None`.
    pub fn take(&self, invocation_id: &str) -> Option<DiffData> {
        self.pending.write().unwrap().remove(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().unwrap().len()
    }
}

fn unified_diff(old: &str, new: &str, path: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut output = String::new();

    output.push_str(&format!("--- a/{}\n", path));
    output.push_str(&format!("+++ b/{}\n", path));

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        output.push_str(&format!("{}", hunk));
    }

    output
}

/// Hook pair that feeds the store from tool lifecycle events.
pub struct DiffRecorder {
    store: Arc<DiffStore>,
}

impl DiffRecorder {
    pub fn new(store: Arc<DiffStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolUseHook for DiffRecorder {
    async fn before_tool(&self, invocation: &ToolInvocation) {
        let Some(path) = invocation.file_path() else {
            return;
        };
        // Missing file means a brand-new one; diff against empty.
        let original = tokio::fs::read_to_string(path).await.unwrap_or_default();
        self.store.capture_original(path, original);
    }

    async fn after_tool(&self, invocation: &ToolInvocation, outcome: &ToolOutcome) {
        if outcome.is_error {
            return;
        }
        let Some(path) = invocation.file_path() else {
            return;
        };
        let updated = tokio::fs::read_to_string(path).await.unwrap_or_default();
        self.store.finalize(&invocation.id, path, &updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Store semantics
    // ========================================================================

    #[test]
    fn test_diff_read_once() {
        let store = DiffStore::new();
        store.capture_original("a.txt", "one\n".into());
        store.finalize("tool-1", "a.txt", "one\ntwo\n");

        let first = store.take("tool-1");
        assert!(first.is_some());
        assert!(first.unwrap().diff.contains("+two"));

        assert!(store.take("tool-1").is_none());
    }

    #[test]
    fn test_original_captured_once_per_turn() {
        let store = DiffStore::new();
        store.capture_original("a.txt", "v0\n".into());
        // A second edit in the same turn must not overwrite the original.
        store.capture_original("a.txt", "v1\n".into());
        store.finalize("tool-2", "a.txt", "v2\n");

        let data = store.take("tool-2").unwrap();
        assert_eq!(data.original, "v0\n");
        assert!(data.diff.contains("-v0"));
        assert!(data.diff.contains("+v2"));
    }

    #[test]
    fn test_begin_turn_clears_originals() {
        let store = DiffStore::new();
        store.capture_original("a.txt", "old\n".into());
        store.begin_turn();
        store.capture_original("a.txt", "new-base\n".into());
        store.finalize("tool-3", "a.txt", "edited\n");

        let data = store.take("tool-3").unwrap();
        assert_eq!(data.original, "new-base\n");
    }

    #[test]
    fn test_new_file_diffs_against_empty() {
        let store = DiffStore::new();
        store.finalize("tool-4", "fresh.txt", "hello\n");

        let data = store.take("tool-4").unwrap();
        assert_eq!(data.original, "");
        assert!(data.diff.contains("+hello"));
    }

    // ========================================================================
    // Hook recorder
    // ========================================================================

    #[tokio::test]
    async fn test_recorder_captures_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        tokio::fs::write(&path, "alpha\n").await.unwrap();

        let store = Arc::new(DiffStore::new());
        let recorder = DiffRecorder::new(Arc::clone(&store));

        let invocation = ToolInvocation {
            id: "tool-9".into(),
            name: "edit".into(),
            input: serde_json::json!({"file_path": path.to_str().unwrap()}),
        };

        recorder.before_tool(&invocation).await;
        tokio::fs::write(&path, "alpha\nbeta\n").await.unwrap();
        recorder
            .after_tool(
                &invocation,
                &ToolOutcome {
                    output: "ok".into(),
                    is_error: false,
                },
            )
            .await;

        let data = store.take("tool-9").unwrap();
        assert_eq!(data.original, "alpha\n");
        assert!(data.diff.contains("+beta"));
    }

    #[tokio::test]
    async fn test_recorder_skips_failed_tools() {
        let store = Arc::new(DiffStore::new());
        let recorder = DiffRecorder::new(Arc::clone(&store));

        let invocation = ToolInvocation {
            id: "tool-10".into(),
            name: "write".into(),
            input: serde_json::json!({"file_path": "/nonexistent/x.txt"}),
        };
        recorder.before_tool(&invocation).await;
        recorder
            .after_tool(
                &invocation,
                &ToolOutcome {
                    output: "permission denied".into(),
                    is_error: true,
                },
            )
            .await;

        assert!(store.take("tool-10").is_none());
    }

    #[tokio::test]
    async fn test_recorder_ignores_non_file_tools() {
        let store = Arc::new(DiffStore::new());
        let recorder = DiffRecorder::new(Arc::clone(&store));

        let invocation = ToolInvocation {
            id: "tool-11".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "echo hi"}),
        };
        recorder.before_tool(&invocation).await;
        recorder
            .after_tool(
                &invocation,
                &ToolOutcome {
                    output: "hi".into(),
                    is_error: false,
                },
            )
            .await;

        assert_eq!(store.pending_count(), 0);
    }
}
