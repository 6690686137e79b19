//! Session identity state
//!
//! Tracks the backend-assigned session identifier, the model bound to it,
//! a staged model awaiting confirmation, and whether the previous turn was
//! interrupted. Written only by the connection output loop (session
//! capture) and the public cancel/reset/switch operations.

use std::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct SessionInner {
    session_id: Option<String>,
    bound_model: Option<String>,
    pending_model: Option<String>,
    was_interrupted: bool,
}

/// Current session identity.
///
/// Invariant: `bound_model` is non-none only while `session_id` is
/// non-none. The pending model is staged at submit time and consumed when
/// the backend reports the new session.
#[derive(Debug, Default)]
pub struct SessionState {
    inner: RwLock<SessionInner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().unwrap().session_id.clone()
    }

    pub fn bound_model(&self) -> Option<String> {
        self.inner.read().unwrap().bound_model.clone()
    }

    pub fn pending_model(&self) -> Option<String> {
        self.inner.read().unwrap().pending_model.clone()
    }

    pub fn was_interrupted(&self) -> bool {
        self.inner.read().unwrap().was_interrupted
    }

    /// Stage a model until the backend confirms a session for it.
    pub fn stage_model(&self, model: impl Into<String>) {
        self.inner.write().unwrap().pending_model = Some(model.into());
    }

    /// Capture the session id reported by a session-init event, consuming
    /// the pending model as the bound one.
    pub fn capture_init(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.session_id = Some(session_id.to_string());
        if let Some(model) = inner.pending_model.take() {
            inner.bound_model = Some(model);
        }
    }

    /// Adopt an externally supplied session id (host-driven switch).
    ///
    /// The bound model is unknown for a resumed session until the backend
    /// confirms it again.
    pub fn switch(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.session_id = Some(session_id.to_string());
        inner.bound_model = None;
        inner.was_interrupted = false;
    }

    /// Drop the session identity, keeping the interruption flag.
    ///
    /// Used when conversation history must be rebuilt from scratch and the
    /// stale backend session can no longer be trusted.
    pub fn invalidate(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.session_id = None;
        inner.bound_model = None;
    }

    /// Full reset to the freshly constructed state.
    pub fn reset(&self) {
        *self.inner.write().unwrap() = SessionInner::default();
    }

    pub fn mark_interrupted(&self) {
        self.inner.write().unwrap().was_interrupted = true;
    }

    pub fn clear_interrupted(&self) {
        self.inner.write().unwrap().was_interrupted = false;
    }
}
