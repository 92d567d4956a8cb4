//! Pending-request table.
//!
//! Maps a correlation id to the completion handle of an outstanding request.
//! `resolve` and `expire` both remove the entry before completing it, so
//! whichever runs first wins and the other becomes a no-op returning `false`.
//! The oneshot sender is consumed on completion, so a second resolution is
//! impossible by construction as well. An entry may own the task that will
//! expire it; removing the entry any other way aborts that task.

use std::collections::HashMap;

use frames::CorrelationId;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClientError;

/// Single-shot completion for one request.
pub(crate) type Completion = oneshot::Sender<Result<Value, ClientError>>;

pub(crate) struct PendingRequest {
    submitted_at: Instant,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: HashMap<CorrelationId, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a request. A duplicate id is rejected and the new completion
    /// is failed immediately; the existing entry is left untouched.
    pub(crate) fn register(&mut self, id: CorrelationId, completion: Completion) -> bool {
        if self.entries.contains_key(&id) {
            complete(id, completion, Err(ClientError::DuplicateId(id)));
            return false;
        }
        let entry = PendingRequest { submitted_at: Instant::now(), completion, timer: None };
        self.entries.insert(id, entry);
        debug!(%id, pending = self.entries.len(), "pending: registered");
        true
    }

    /// Attach the task that expires `id`. Aborted right away if `id` is gone.
    pub(crate) fn attach_timer(&mut self, id: CorrelationId, timer: AbortHandle) {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Complete a request with its response. `false` if the id is absent.
    pub(crate) fn resolve(&mut self, id: CorrelationId, value: Value) -> bool {
        let Some(mut entry) = self.entries.remove(&id) else {
            return false;
        };
        entry.cancel_timer();
        debug!(%id, elapsed = ?entry.submitted_at.elapsed(), "pending: resolved");
        complete(id, entry.completion, Ok(value));
        true
    }

    /// Fail a request with [`ClientError::Timeout`]. `false` if already gone.
    pub(crate) fn expire(&mut self, id: CorrelationId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        let elapsed = entry.submitted_at.elapsed();
        debug!(%id, ?elapsed, "pending: expired");
        complete(id, entry.completion, Err(ClientError::Timeout { id, elapsed }));
        true
    }

    /// Fail a request with an explicit error. `false` if already gone.
    pub(crate) fn fail(&mut self, id: CorrelationId, error: ClientError) -> bool {
        let Some(mut entry) = self.entries.remove(&id) else {
            return false;
        };
        entry.cancel_timer();
        complete(id, entry.completion, Err(error));
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn complete(id: CorrelationId, completion: Completion, result: Result<Value, ClientError>) {
    if completion.send(result).is_err() {
        debug!(%id, "pending: caller dropped before completion");
    }
}

#[cfg(test)]
#[path = "pending_test.rs"]
mod tests;
