//! Single-producer/single-consumer message channel
//!
//! Feeds user turns into the long-lived backend connection as one
//! continuous input sequence:
//!
//! - `send` buffers when no consumer is waiting and resolves a waiting
//!   consumer immediately otherwise
//! - `recv` drains buffered items in insertion order before waiting
//! - `close` resolves a waiting consumer with end-of-sequence; sends
//!   after close are silently dropped
//!
//! Delivery is totally ordered: items arrive in send order, never
//! reordered or duplicated.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::Notify;

struct ChannelState<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

struct ChannelInner<T> {
    state: Mutex<ChannelState<T>>,
    notify: Notify,
}

/// SPSC asynchronous queue with explicit close semantics.
pub struct MessageChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for MessageChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for MessageChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageChannel<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an item for the consumer. Dropped silently after close.
    pub fn send(&self, item: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.buffer.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Receive the next item, draining the buffer before waiting.
    ///
    /// Returns `None` once the channel is closed and the buffer is empty.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(item) = state.buffer.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the channel. A waiting consumer resolves with end-of-sequence.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Buffered items not yet pulled by the consumer.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumer handle for the single reader.
    pub fn consumer(&self) -> MessageConsumer<T> {
        MessageConsumer {
            channel: self.clone(),
        }
    }
}

/// Consumer half handed to the backend connection.
pub struct MessageConsumer<T> {
    channel: MessageChannel<T>,
}

impl<T> MessageConsumer<T> {
    /// Pull the next item, draining buffered items first.
    pub async fn recv(&mut self) -> Option<T> {
        self.channel.recv().await
    }
}

impl<T: Send + 'static> MessageConsumer<T> {
    /// Lazy, restartable-per-call view of the input sequence.
    pub fn into_stream(mut self) -> impl Stream<Item = T> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}
