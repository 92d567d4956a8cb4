//! Outbound queue.
//!
//! Serialized messages waiting for a live connection, kept in submission
//! order. A drain sends from the head; a failed send leaves that message and
//! everything behind it queued, in order, so nothing is sent twice and nothing
//! jumps the line on the next drain. A write that stays blocked past the
//! caller's deadline is abandoned the same way, so a peer that stops reading
//! cannot hold a drain open. `&mut self` on `drain_into` serializes drains: a
//! second drain cannot start while one is in progress.

use std::collections::VecDeque;
use std::time::Duration;

use frames::CorrelationId;
use futures::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// One serialized message. `id` is set for requests, `None` for fire-and-forget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Outbound {
    pub(crate) id: Option<CorrelationId>,
    pub(crate) text: String,
}

impl Outbound {
    pub(crate) fn request(id: CorrelationId, text: String) -> Self {
        Self { id: Some(id), text }
    }

    pub(crate) fn message(text: String) -> Self {
        Self { id: None, text }
    }

    pub(crate) fn to_ws(&self) -> Message {
        Message::text(self.text.clone())
    }
}

/// Why a drain stopped before the queue was empty.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DrainError<E> {
    #[error("sink rejected message: {0}")]
    Sink(E),
    #[error("write stalled for {0:?}")]
    Stalled(Duration),
}

#[derive(Default)]
pub(crate) struct OutboundQueue {
    items: VecDeque<Outbound>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&mut self, item: Outbound) {
        self.items.push_back(item);
    }

    #[cfg(test)]
    pub(crate) fn pop_front(&mut self) -> Option<Outbound> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Send every queued message through `sink` in FIFO order.
    ///
    /// Each write gets `write_timeout`. Returns the number sent; on error the
    /// failing message stays at the head.
    pub(crate) async fn drain_into<S>(&mut self, sink: &mut S, write_timeout: Duration) -> Result<usize, DrainError<S::Error>>
    where
        S: Sink<Message> + Unpin,
    {
        let mut sent = 0;
        while let Some(item) = self.items.front() {
            let msg = item.to_ws();
            match tokio::time::timeout(write_timeout, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(DrainError::Sink(e)),
                Err(_) => {
                    debug!(sent, queued = self.items.len(), "outbound: write stalled");
                    return Err(DrainError::Stalled(write_timeout));
                }
            }
            self.items.pop_front();
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "outbound: drained");
        }
        Ok(sent)
    }
}

#[cfg(test)]
#[path = "outbound_test.rs"]
mod tests;
