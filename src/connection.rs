//! Persistent backend connection lifecycle
//!
//! Owns the long-lived connection: start, reconfigure-in-place, restart,
//! close. The state machine is
//! `unconnected -> starting -> active -> closing -> unconnected`, with
//! concurrent start attempts deduplicated (a second caller awaits the
//! in-flight start rather than starting twice).
//!
//! One output-consuming loop runs per active period. Session-init events
//! update session state without being routed; ordinary events become
//! chunks forwarded to the head handler; turn completion resolves it.
//! Loop exit always drains every handler before returning to unconnected.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendControl, BackendEvent, BackendLauncher, StartOptions, ToolUseHook};
use crate::channel::MessageChannel;
use crate::chunk::{Attachment, StreamChunk, UserMessage};
use crate::error::CoreError;
use crate::gate::ToolGate;
use crate::router::{ResponseRouter, TurnStream};
use crate::session::SessionState;
use crate::settings::{ConnectionSettings, ConnectionSnapshot};

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Unconnected,
    Starting,
    Active,
    Closing,
}

struct LiveConnection {
    channel: MessageChannel<UserMessage>,
    control: Arc<dyn BackendControl>,
    cancel: CancellationToken,
    loop_task: JoinHandle<()>,
}

struct ConnState {
    phase: ConnectionPhase,
    live: Option<LiveConnection>,
    last_applied: Option<ConnectionSnapshot>,
}

/// Manages the persistent backend connection and wires the message
/// channel and response router together.
pub struct ConnectionManager {
    launcher: Arc<dyn BackendLauncher>,
    session: Arc<SessionState>,
    router: Arc<ResponseRouter>,
    gate: Arc<dyn ToolGate>,
    hooks: Vec<Arc<dyn ToolUseHook>>,
    state: Arc<Mutex<ConnState>>,
    start_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        session: Arc<SessionState>,
        router: Arc<ResponseRouter>,
        gate: Arc<dyn ToolGate>,
        hooks: Vec<Arc<dyn ToolUseHook>>,
    ) -> Self {
        Self {
            launcher,
            session,
            router,
            gate,
            hooks,
            state: Arc::new(Mutex::new(ConnState {
                phase: ConnectionPhase::Unconnected,
                live: None,
                last_applied: None,
            })),
            start_lock: Mutex::new(()),
        }
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase
    }

    /// Start the connection unless it is already active.
    ///
    /// Concurrent callers serialize on the start lock, so a second caller
    /// awaits the in-flight start and then sees the active connection.
    pub async fn ensure_started(&self, settings: &ConnectionSettings) -> Result<(), CoreError> {
        let _start = self.start_lock.lock().await;

        if self.state.lock().await.phase == ConnectionPhase::Active {
            return Ok(());
        }

        validate_settings(settings)?;

        self.state.lock().await.phase = ConnectionPhase::Starting;
        tracing::info!(model = %settings.model, "starting backend connection");

        let channel: MessageChannel<UserMessage> = MessageChannel::new();
        let cancel = CancellationToken::new();
        let options =
            StartOptions::from_settings(settings, self.gate.clone(), self.hooks.clone());

        let handle = match self
            .launcher
            .launch(options, channel.consumer(), cancel.clone())
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%error, "backend launch failed");
                self.state.lock().await.phase = ConnectionPhase::Unconnected;
                return Err(error);
            }
        };

        // The initial model selection is what actually brings the
        // connection alive; deferring it would stall establishment until
        // the first message.
        if let Err(error) = handle.control.set_model(&settings.model).await {
            tracing::warn!(%error, "initial model selection failed");
            channel.close();
            cancel.cancel();
            self.state.lock().await.phase = ConnectionPhase::Unconnected;
            return Err(error);
        }

        let loop_task = tokio::spawn(Self::run_output_loop(
            Arc::clone(&self.router),
            Arc::clone(&self.session),
            Arc::clone(&self.state),
            handle.events,
            cancel.clone(),
        ));

        let mut state = self.state.lock().await;
        state.live = Some(LiveConnection {
            channel,
            control: handle.control,
            cancel,
            loop_task,
        });
        state.last_applied = Some(ConnectionSnapshot::of(settings));
        state.phase = ConnectionPhase::Active;
        Ok(())
    }

    /// Bring the live connection in line with the settings: cheap in-place
    /// updates where supported, a full restart otherwise. Each field is
    /// compared against the last-applied snapshot and only re-sent when
    /// changed.
    pub async fn reconcile(&self, settings: &ConnectionSettings) -> Result<(), CoreError> {
        let (delta, control) = {
            let state = self.state.lock().await;
            if state.phase != ConnectionPhase::Active {
                (None, None)
            } else {
                let next = ConnectionSnapshot::of(settings);
                (
                    state.last_applied.as_ref().map(|last| last.delta(&next)),
                    state.live.as_ref().map(|live| live.control.clone()),
                )
            }
        };

        let Some(delta) = delta else {
            return self.ensure_started(settings).await;
        };
        if delta.is_empty() {
            return Ok(());
        }

        if delta.requires_restart() {
            tracing::info!("configuration change requires a connection restart");
            self.close("configuration change").await;
            return self.ensure_started(settings).await;
        }

        let control = control.ok_or(CoreError::NotConnected)?;
        if delta.model_changed {
            control.set_model(&settings.model).await?;
        }
        if delta.thinking_budget_changed {
            control.set_thinking_budget(settings.thinking_budget).await?;
        }
        if delta.permission_mode_changed {
            control.set_permission_mode(settings.permission_mode).await?;
        }
        if delta.tool_servers_changed {
            control.set_tool_servers(&settings.tool_servers).await?;
        }

        self.state.lock().await.last_applied = Some(ConnectionSnapshot::of(settings));
        Ok(())
    }

    /// Submit one user turn and hand back its chunk stream.
    ///
    /// Configuration deltas are applied strictly before the prompt is
    /// sent. Attachments are ordered before text in the outgoing message.
    pub async fn submit_turn(
        &self,
        settings: &ConnectionSettings,
        prompt: &str,
        attachments: &[Attachment],
        recap: Option<String>,
    ) -> Result<TurnStream, CoreError> {
        self.reconcile(settings).await?;

        let channel = {
            let state = self.state.lock().await;
            if state.phase != ConnectionPhase::Active {
                return Err(CoreError::NotConnected);
            }
            state
                .live
                .as_ref()
                .map(|live| live.channel.clone())
                .ok_or(CoreError::NotConnected)?
        };

        let stream = self.router.register();
        let message = UserMessage::compose(prompt, attachments, recap.as_deref());
        channel.send(message);
        tracing::debug!(turn = stream.id(), "user turn submitted");
        Ok(stream)
    }

    /// Interrupt the in-flight turn.
    ///
    /// Never fails: the cancellation token stops output forwarding, the
    /// session is marked interrupted so the next turn rebuilds context,
    /// the backend interrupt is best-effort, and the in-flight handler
    /// resolves via normal completion. The next query starts a fresh
    /// connection, since the backend session has diverged from what the
    /// user saw.
    pub async fn cancel_active(&self) {
        self.session.mark_interrupted();
        // Resolve the in-flight caller first so it observes completion,
        // not the drain.
        self.router.complete_head(Some("interrupted".to_string()));
        self.close("user interrupt").await;
    }

    /// Tear the connection down. Interrupt errors are swallowed; every
    /// pending handler is drained; the snapshot is reset so the next
    /// start re-applies everything from scratch.
    pub async fn close(&self, reason: &str) {
        let live = {
            let mut state = self.state.lock().await;
            if state.phase == ConnectionPhase::Unconnected && state.live.is_none() {
                state.last_applied = None;
                return;
            }
            state.phase = ConnectionPhase::Closing;
            state.live.take()
        };

        if let Some(live) = live {
            if let Err(error) = live.control.interrupt().await {
                tracing::debug!(%error, "interrupt during close failed");
            }
            live.channel.close();
            live.cancel.cancel();
            live.loop_task.abort();
        }

        self.router.drain_all();

        let mut state = self.state.lock().await;
        state.phase = ConnectionPhase::Unconnected;
        state.last_applied = None;
        tracing::info!(reason, "backend connection closed");
    }

    async fn run_output_loop(
        router: Arc<ResponseRouter>,
        session: Arc<SessionState>,
        state: Arc<Mutex<ConnState>>,
        mut events: mpsc::Receiver<BackendEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("output loop cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!("backend event stream ended");
                        break;
                    }
                },
            };

            match event {
                BackendEvent::SessionInit { session_id } => {
                    // Session capture only; init events are not routed.
                    tracing::debug!(%session_id, "captured backend session");
                    session.capture_init(&session_id);
                }
                BackendEvent::TurnCompleted { stop_reason } => {
                    router.complete_head(stop_reason);
                }
                BackendEvent::Error { message } => {
                    if router.head_saw_any_chunk() {
                        tracing::warn!(%message, "backend failed mid-turn");
                        router.fail_head(&message);
                    } else {
                        // Cold-start failure: nothing reached the caller,
                        // so a retry on a fresh connection is safe.
                        tracing::warn!(%message, "backend failed before producing output");
                        break;
                    }
                }
                BackendEvent::TextDelta { text } => {
                    router.route_chunk(StreamChunk::TextDelta { text });
                }
                BackendEvent::ThinkingDelta { text } => {
                    router.route_chunk(StreamChunk::ThinkingDelta { text });
                }
                BackendEvent::ToolStart { id, name, input } => {
                    router.route_chunk(StreamChunk::ToolStart { id, name, input });
                }
                BackendEvent::ToolEnd {
                    id,
                    name,
                    output,
                    is_error,
                } => {
                    router.route_chunk(StreamChunk::ToolEnd {
                        id,
                        name,
                        output,
                        is_error,
                    });
                }
                BackendEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    router.route_chunk(StreamChunk::Usage {
                        input_tokens,
                        output_tokens,
                        session_id: None,
                    });
                }
            }
        }

        // Loop exit, normal or not: no caller may be left pending.
        router.drain_all();
        let mut state = state.lock().await;
        if let Some(live) = state.live.take() {
            live.channel.close();
            live.cancel.cancel();
        }
        state.last_applied = None;
        state.phase = ConnectionPhase::Unconnected;
    }
}

fn validate_settings(settings: &ConnectionSettings) -> Result<(), CoreError> {
    if !settings.workspace.exists() {
        return Err(CoreError::MissingWorkspace(
            settings.workspace.display().to_string(),
        ));
    }
    if let Some(path) = &settings.cli_path {
        if !path.exists() {
            return Err(CoreError::MissingBinary(path.display().to_string()));
        }
    }
    Ok(())
}
