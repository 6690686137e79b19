//! Plan-mode state and plan file recognition
//!
//! Plans live in a user-scoped plans directory by convention; a path is a
//! plan file when it resolves under that directory. The tracker remembers
//! the most recently written plan file, reads its content back when the
//! agent asks to leave plan mode, and carries approved plan content into
//! the next system prompt.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct PlanInner {
    current_plan_path: Option<PathBuf>,
    approved_plan: Option<String>,
}

/// Tracks the active plan file and approved plan content.
#[derive(Debug)]
pub struct PlanTracker {
    plans_dir: PathBuf,
    inner: RwLock<PlanInner>,
}

impl PlanTracker {
    /// Default plans directory under the user's home.
    pub fn new() -> Self {
        let plans_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tether")
            .join("plans");
        Self::with_dir(plans_dir)
    }

    pub fn with_dir(plans_dir: impl Into<PathBuf>) -> Self {
        Self {
            plans_dir: plans_dir.into(),
            inner: RwLock::new(PlanInner::default()),
        }
    }

    pub fn plans_dir(&self) -> &Path {
        &self.plans_dir
    }

    /// Whether a path resolves under the plans directory.
    pub fn is_plan_path(&self, path: &Path) -> bool {
        path.starts_with(&self.plans_dir)
    }

    /// Record a file write; remembers the path when it is a plan file.
    pub fn note_write(&self, path: &Path) {
        if self.is_plan_path(path) {
            self.inner.write().unwrap().current_plan_path = Some(path.to_path_buf());
        }
    }

    pub fn current_plan_path(&self) -> Option<PathBuf> {
        self.inner.read().unwrap().current_plan_path.clone()
    }

    /// Read the current plan content, preferring the on-disk file and
    /// falling back to the supplied text when the file is unreadable.
    pub async fn read_current(&self, fallback: Option<&str>) -> Option<String> {
        let path = self.current_plan_path();
        if let Some(path) = path {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                return Some(content);
            }
            tracing::warn!(path = %path.display(), "plan file unreadable, using tool input");
        }
        fallback.map(|text| text.to_string())
    }

    /// Record plan content the user approved.
    pub fn approve(&self, content: String) {
        self.inner.write().unwrap().approved_plan = Some(content);
    }

    /// Consume approved plan content for the next system prompt.
    pub fn take_approved(&self) -> Option<String> {
        self.inner.write().unwrap().approved_plan.take()
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = PlanInner::default();
    }
}

impl Default for PlanTracker {
    fn default() -> Self {
        Self::new()
    }
}
