//! Response routing for the single backend output stream
//!
//! The backend emits one interleaved output stream; the router multiplexes
//! it to the one caller currently awaiting a turn. Handlers are resolved
//! in strict FIFO order relative to registration:
//!
//! - `route_chunk` delivers to the head handler only (never broadcast)
//! - `complete_head` / `fail_head` pop and resolve the head exactly once
//! - `drain_all` resolves every still-registered handler so no caller is
//!   left hanging on forced shutdown
//!
//! `usage` chunks are annotated with the session id current at the moment
//! of forwarding, since the id may only become known mid-turn.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::chunk::StreamChunk;
use crate::session::SessionState;

struct PendingTurn {
    id: String,
    tx: mpsc::UnboundedSender<StreamChunk>,
    saw_any_chunk: bool,
    saw_stream_text: bool,
}

/// Caller-side view of one turn: a lazy chunk sequence ending with a
/// terminal `done` or `error` chunk.
pub struct TurnStream {
    id: String,
    rx: UnboundedReceiverStream<StreamChunk>,
}

impl TurnStream {
    /// Handler id for this turn.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pull the next chunk.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        use futures::StreamExt;
        self.next().await
    }

    /// A stream that yields a single terminal error chunk. Used to report
    /// configuration failures without touching the connection.
    pub fn immediate_error(message: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamChunk::Error {
            message: message.into(),
        });
        Self {
            id: Uuid::new_v4().to_string(),
            rx: UnboundedReceiverStream::new(rx),
        }
    }

    /// Collect every remaining chunk (test helper and simple hosts).
    pub async fn collect_all(mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk);
        }
        chunks
    }
}

impl Stream for TurnStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// FIFO multiplexer from the backend output loop to awaiting callers.
pub struct ResponseRouter {
    session: Arc<SessionState>,
    queue: Mutex<VecDeque<PendingTurn>>,
}

impl ResponseRouter {
    pub fn new(session: Arc<SessionState>) -> Self {
        Self {
            session,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a handler for the next turn and return its chunk stream.
    pub fn register(&self) -> TurnStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();

        self.queue.lock().unwrap().push_back(PendingTurn {
            id: id.clone(),
            tx,
            saw_any_chunk: false,
            saw_stream_text: false,
        });

        TurnStream {
            id,
            rx: UnboundedReceiverStream::new(rx),
        }
    }

    /// Deliver a chunk to the head handler.
    ///
    /// Chunks arriving with no handler registered are dropped; the caller
    /// contract is one turn in flight at a time.
    pub fn route_chunk(&self, mut chunk: StreamChunk) {
        if let StreamChunk::Usage { session_id, .. } = &mut chunk {
            *session_id = self.session.session_id();
        }

        let mut queue = self.queue.lock().unwrap();
        let Some(head) = queue.front_mut() else {
            tracing::debug!(?chunk, "dropping chunk with no registered handler");
            return;
        };

        head.saw_any_chunk = true;
        if chunk.is_stream_text() {
            head.saw_stream_text = true;
        }
        // A send failure means the caller dropped its stream; the handler
        // stays queued until completion so ordering is preserved.
        let _ = head.tx.send(chunk);
    }

    /// Pop the head handler and resolve it via completion.
    pub fn complete_head(&self, stop_reason: Option<String>) -> bool {
        let Some(head) = self.queue.lock().unwrap().pop_front() else {
            return false;
        };
        let _ = head.tx.send(StreamChunk::Done { stop_reason });
        true
    }

    /// Pop the head handler and resolve it via a terminal error chunk.
    pub fn fail_head(&self, message: &str) -> bool {
        let Some(head) = self.queue.lock().unwrap().pop_front() else {
            return false;
        };
        let _ = head.tx.send(StreamChunk::Error {
            message: message.to_string(),
        });
        true
    }

    /// Resolve every registered handler via completion.
    ///
    /// Used on forced shutdown so no caller hangs indefinitely.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<_> = self.queue.lock().unwrap().drain(..).collect();
        let count = drained.len();
        for handler in drained {
            let _ = handler.tx.send(StreamChunk::Done { stop_reason: None });
        }
        if count > 0 {
            tracing::debug!(count, "drained pending turn handlers");
        }
        count
    }

    /// Whether the head handler has received any chunk yet. Drives the
    /// cold-start failure heuristic: no output ever produced means a
    /// silent retry is safe.
    pub fn head_saw_any_chunk(&self) -> bool {
        self.queue
            .lock()
            .unwrap()
            .front()
            .map(|head| head.saw_any_chunk)
            .unwrap_or(false)
    }

    /// Whether the head handler has received streamed assistant text.
    pub fn head_saw_stream_text(&self) -> bool {
        self.queue
            .lock()
            .unwrap()
            .front()
            .map(|head| head.saw_stream_text)
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
