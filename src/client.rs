//! Client façade and its driver task.
//!
//! DESIGN
//! ======
//! `Client` is a cheap, cloneable handle. All state lives in one driver task
//! that owns the connection handle, the pending-request table and the
//! outbound queue, and processes commands, connect results, timer expiries
//! and inbound frames strictly one at a time. No lock is needed: nothing else
//! can reach the table or the queue.
//!
//! Reconnection is on demand. A send while not Open queues the message and
//! starts a connection attempt; nothing retries on a timer. When the attempt
//! succeeds the queue is drained in FIFO order before the next command runs,
//! so anything submitted during the attempt goes out after the backlog.
//!
//! Every request arms its own timer at registration. The timer and the
//! matching response race through the same table; whichever removes the entry
//! first completes the caller, the other finds nothing. A response or failure
//! aborts the timer along with the entry.
//!
//! The driver awaits socket writes, so every write is bounded by
//! `send_timeout`. A stalled write is handled like any other transport
//! failure: the message stays queued, the socket is dropped and a reconnect
//! starts. A peer that stops reading delays expiries by at most one
//! `send_timeout`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use frames::CorrelationId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionHandle, ConnectionState, SocketEvent, WsStream};
use crate::correlation::IdGenerator;
use crate::dispatch::{self, DispatchOutcome};
use crate::error::{ClientError, ConnectError};
use crate::outbound::{Outbound, OutboundQueue};
use crate::pending::{Completion, PendingTable};

// =============================================================================
// COMMANDS
// =============================================================================

enum Command {
    Request { id: CorrelationId, text: String, completion: Completion },
    Message { text: String },
    Open,
    Close { done: oneshot::Sender<()> },
    Stats { reply: oneshot::Sender<ClientStats> },
    Connected { generation: u64, result: Result<WsStream, ConnectError> },
    Expire { id: CorrelationId },
}

/// Point-in-time view of the driver, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub state: ConnectionState,
    /// Requests awaiting a response or a timeout.
    pub pending: usize,
    /// Messages waiting for an open connection.
    pub queued: usize,
    pub resolved: u64,
    pub unsolicited: u64,
    pub uncorrelated: u64,
    pub malformed: u64,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Request/response client over a single websocket.
///
/// Created with [`Client::new`]; every clone talks to the same driver and
/// the same connection. The driver stops when the last clone is dropped, and
/// any request still outstanding then fails with [`ClientError::Shutdown`].
#[derive(Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Command>,
    ids: Arc<IdGenerator>,
    state: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("state", &*self.state.borrow()).finish_non_exhaustive()
    }
}

impl Client {
    /// Spawn the driver on the current tokio runtime.
    ///
    /// No socket is opened yet; the first send (or [`Client::open_socket`])
    /// starts one.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let driver = Driver {
            conn: ConnectionHandle::new(&config, state_tx),
            pending: PendingTable::new(),
            queue: OutboundQueue::new(),
            stats: Counters::default(),
            self_tx: tx.downgrade(),
            rx,
            config,
        };
        tokio::spawn(driver.run());
        Self { tx, ids: Arc::new(IdGenerator::new()), state: state_rx }
    }

    /// Submit a request and return a future for its response.
    ///
    /// The request is registered and its timeout armed before this returns,
    /// whether or not the future is ever awaited.
    ///
    /// # Errors
    ///
    /// [`ClientError::Codec`] if the payload is not a serializable JSON object,
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub fn send_request<T>(&self, payload: &T) -> Result<PendingResponse, ClientError>
    where
        T: Serialize + ?Sized,
    {
        let id = self.ids.next();
        let text = frames::encode_request(id, frames::now_ms(), payload)?;
        let (completion, rx) = oneshot::channel();
        self.submit(Command::Request { id, text, completion })?;
        Ok(PendingResponse { id, rx })
    }

    /// Submit a request and wait for its response or its timeout.
    ///
    /// # Errors
    ///
    /// See [`Client::send_request`] and [`PendingResponse`].
    pub async fn request<T>(&self, payload: &T) -> Result<Value, ClientError>
    where
        T: Serialize + ?Sized,
    {
        self.send_request(payload)?.await
    }

    /// Fire-and-forget. If the payload cannot be serialized, its `Debug`
    /// rendering is sent as-is instead.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub fn send_message<T>(&self, payload: &T) -> Result<(), ClientError>
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        let text = match frames::encode_message(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "client: serialization failed, sending raw payload");
                format!("{payload:?}")
            }
        };
        self.send_text(text)
    }

    /// Fire-and-forget a raw text frame.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.submit(Command::Message { text: text.into() })
    }

    /// Start connecting now instead of on the next send. No-op unless Disconnected.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub fn open_socket(&self) -> Result<(), ClientError> {
        self.submit(Command::Open)
    }

    /// Close the connection (or abandon an attempt in flight). Resolves once
    /// the handle is Disconnected. Queued messages stay queued.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub async fn close_socket(&self) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::Close { done })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver stops first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ClientError> {
        let mut state = self.state.clone();
        match state.wait_for(|s| *s == target).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ClientError::Shutdown),
        }
    }

    /// Snapshot of connection state, table and queue sizes, and dispatch counters.
    ///
    /// # Errors
    ///
    /// [`ClientError::Shutdown`] if the driver is gone.
    pub async fn stats(&self) -> Result<ClientStats, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Stats { reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    fn submit(&self, cmd: Command) -> Result<(), ClientError> {
        self.tx.send(cmd).map_err(|_| ClientError::Shutdown)
    }
}

// =============================================================================
// PENDING RESPONSE
// =============================================================================

/// Completion of one request: its response payload, or why there is none.
///
/// Resolves exactly once. Dropping it does not cancel the request; the
/// timeout still clears the table entry.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
}

impl PendingResponse {
    #[must_use]
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(ClientError::Shutdown),
        })
    }
}

// =============================================================================
// DRIVER
// =============================================================================

#[derive(Default)]
struct Counters {
    resolved: u64,
    unsolicited: u64,
    uncorrelated: u64,
    malformed: u64,
}

struct Driver {
    config: ClientConfig,
    conn: ConnectionHandle,
    pending: PendingTable,
    queue: OutboundQueue,
    stats: Counters,
    rx: mpsc::UnboundedReceiver<Command>,
    /// Weak so timers and connect tasks never keep the driver alive.
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl Driver {
    async fn run(mut self) {
        debug!(url = %self.config.url, "client: driver started");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                event = self.conn.next_event() => self.handle_socket_event(event),
            }
        }
        self.conn.close().await;
        info!(pending = self.pending.len(), queued = self.queue.len(), "client: driver stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request { id, text, completion } => {
                if !self.pending.register(id, completion) {
                    return;
                }
                let timer = self.arm_timeout(id);
                self.pending.attach_timer(id, timer);
                self.deliver(Outbound::request(id, text)).await;
            }
            Command::Message { text } => self.deliver(Outbound::message(text)).await,
            Command::Open => self.start_connect(),
            Command::Close { done } => {
                self.conn.close().await;
                if done.send(()).is_err() {
                    debug!("client: close caller went away");
                }
            }
            Command::Stats { reply } => {
                if reply.send(self.snapshot()).is_err() {
                    debug!("client: stats caller went away");
                }
            }
            Command::Connected { generation, result } => {
                if self.conn.accept(generation, result) {
                    self.flush().await;
                }
            }
            Command::Expire { id } => {
                if self.pending.expire(id) {
                    warn!(%id, timeout = ?self.config.request_timeout, "client: request timed out");
                }
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Frame(msg) => match dispatch::dispatch_message(&msg, &mut self.pending) {
                Some(DispatchOutcome::Resolved(_)) => self.stats.resolved += 1,
                Some(DispatchOutcome::Unsolicited(_)) => self.stats.unsolicited += 1,
                Some(DispatchOutcome::Uncorrelated) => self.stats.uncorrelated += 1,
                Some(DispatchOutcome::Malformed(_)) => self.stats.malformed += 1,
                None => {}
            },
            SocketEvent::Closed => self.conn.lost(),
        }
    }

    /// Send now if Open with nothing ahead in the queue, otherwise queue and connect.
    async fn deliver(&mut self, item: Outbound) {
        if item.text.len() > self.config.max_message_size {
            self.reject(item);
            return;
        }
        if self.conn.state() != ConnectionState::Open || !self.queue.is_empty() {
            self.queue.enqueue(item);
            debug!(queued = self.queue.len(), state = ?self.conn.state(), "client: message queued");
            self.start_connect();
            return;
        }

        if let Err(e) = self.conn.send(item.to_ws()).await {
            warn!(error = %e, "client: send failed, queueing and reconnecting");
            self.queue.enqueue(item);
            self.conn.lost();
            self.start_connect();
        }
    }

    /// Drain the queue into the live socket.
    async fn flush(&mut self) {
        let Some(socket) = self.conn.socket_mut() else {
            return;
        };
        let Err(error) = self.queue.drain_into(socket, self.config.send_timeout).await else {
            return;
        };
        warn!(%error, queued = self.queue.len(), "client: drain failed, reconnecting");
        self.conn.lost();
        self.start_connect();
    }

    fn start_connect(&mut self) {
        let Some(attempt) = self.conn.open() else {
            return;
        };
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let (generation, result) = attempt.run().await;
            let Some(tx) = tx.upgrade() else {
                return;
            };
            if tx.send(Command::Connected { generation, result }).is_err() {
                debug!(generation, "client: driver gone before connect finished");
            }
        });
    }

    fn arm_timeout(&self, id: CorrelationId) -> AbortHandle {
        let tx = self.self_tx.clone();
        let timeout = self.config.request_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(tx) = tx.upgrade() else {
                return;
            };
            if tx.send(Command::Expire { id }).is_err() {
                debug!(%id, "client: driver gone before timeout fired");
            }
        });
        task.abort_handle()
    }

    /// Drop a message too large to ever send, failing its request.
    fn reject(&mut self, item: Outbound) {
        let reason = format!(
            "message of {} bytes exceeds max_message_size {}",
            item.text.len(),
            self.config.max_message_size
        );
        warn!(id = ?item.id, %reason, "client: message rejected");
        if let Some(id) = item.id {
            self.pending.fail(id, ClientError::Send(reason));
        }
    }

    fn snapshot(&self) -> ClientStats {
        ClientStats {
            state: self.conn.state(),
            pending: self.pending.len(),
            queued: self.queue.len(),
            resolved: self.stats.resolved,
            unsolicited: self.stats.unsolicited,
            uncorrelated: self.stats.uncorrelated,
            malformed: self.stats.malformed,
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
