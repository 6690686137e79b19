//! Tether Core Library
//!
//! Embeddable session and streaming orchestration core for host
//! applications that drive a persistent, tool-using AI agent backend.
//! The host renders chat; this crate keeps one long-lived backend
//! connection alive across turns, multiplexes its single output stream to
//! the caller awaiting each turn, reconciles session identity across
//! interruptions and restarts, and gates every tool invocation through a
//! permission engine.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use tether_core::{QueryOptions, StreamChunk, Tether};
//!
//! # async fn run(launcher: Arc<dyn tether_core::BackendLauncher>) -> anyhow::Result<()> {
//! let tether = Tether::builder()
//!     .launcher(launcher)
//!     .workspace("/my-project")
//!     .model("claude-sonnet-4-20250514")
//!     .build()?;
//!
//! let mut stream = tether.query("What files handle auth?", QueryOptions::default()).await;
//! while let Some(chunk) = stream.next().await {
//!     match chunk {
//!         StreamChunk::TextDelta { text } => print!("{text}"),
//!         StreamChunk::Done { .. } | StreamChunk::Error { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Tether (facade)
//!   +-- ConnectionManager (persistent backend lifecycle + output loop)
//!   |     +-- MessageChannel (user turn input sequence)
//!   |     +-- ResponseRouter (FIFO turn handler multiplexing)
//!   +-- PermissionEngine (tool gating: auto / prompt / plan)
//!   |     +-- RuleBook (session + permanent allow rules)
//!   |     +-- PlanTracker (plan files, approved plan carry-over)
//!   +-- DiffStore (pre/post tool hooks, read-once edit diffs)
//!   +-- SessionState (id, bound model, interruption flag)
//! ```

pub mod backend;
pub mod channel;
pub mod chunk;
pub mod connection;
pub mod diff_store;
pub mod error;
pub mod gate;
pub mod plan;
pub mod router;
pub mod rules;
pub mod service;
pub mod session;
pub mod settings;

// Re-export key types at crate root for ergonomic usage
pub use backend::{
    BackendControl, BackendEvent, BackendHandle, BackendLauncher, StartOptions, ToolInvocation,
    ToolOutcome, ToolUseHook,
};
pub use channel::{MessageChannel, MessageConsumer};
pub use chunk::{Attachment, HistoryMessage, Role, StreamChunk, UserMessage};
pub use connection::{ConnectionManager, ConnectionPhase};
pub use diff_store::{DiffData, DiffStore};
pub use error::CoreError;
pub use gate::{
    ApprovalCallback, ApprovalDecision, ApprovalRequest, GateVerdict, PermissionEngine,
    PlanDecision, PlanDecisionCallback, PlanEntryCallback, QuestionCallback, RuleSink, ToolGate,
    ToolProposal,
};
pub use plan::PlanTracker;
pub use router::{ResponseRouter, TurnStream};
pub use service::{QueryOptions, Tether, TetherBuilder};
pub use session::SessionState;
pub use settings::{ConnectionSettings, ConnectionSnapshot, PermissionMode, ToolServerConfig};
