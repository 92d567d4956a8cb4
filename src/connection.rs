//! Connection handle.
//!
//! DESIGN
//! ======
//! Owns at most one websocket at a time and the state it is in. A connection
//! attempt runs off the driver task and reports back tagged with the
//! generation it was started under; `accept` drops any result whose
//! generation is stale, so a socket from a superseded attempt can never
//! become the live one. Replacing or losing the socket drops it, and with it
//! every pending read on it.
//!
//! LIFECYCLE
//! =========
//! Disconnected -> (open) -> Connecting -> (accept Ok) -> Open
//! Connecting/Open -> (close) -> Closing -> Disconnected
//! Open -> (peer close / read error / send error / stalled send) -> Disconnected

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ConnectError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the connection handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// What the live socket produced.
pub(crate) enum SocketEvent {
    Frame(Message),
    Closed,
}

/// Why a send did not reach the transport.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
    #[error("connection is not open")]
    NotOpen,
    #[error("websocket send failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("websocket send stalled for {0:?}")]
    Stalled(Duration),
}

/// A connection attempt detached from the handle, to be run on its own task.
pub(crate) struct ConnectAttempt {
    generation: u64,
    url: String,
    timeout: Duration,
    ws_config: WebSocketConfig,
}

impl ConnectAttempt {
    pub(crate) async fn run(self) -> (u64, Result<WsStream, ConnectError>) {
        let connect = tokio_tungstenite::connect_async_with_config(self.url.as_str(), Some(self.ws_config), false);
        let result = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(ConnectError::Handshake(Box::new(e))),
            Err(_) => Err(ConnectError::Timeout(self.timeout)),
        };
        (self.generation, result)
    }
}

pub(crate) struct ConnectionHandle {
    url: String,
    connect_timeout: Duration,
    send_timeout: Duration,
    ws_config: WebSocketConfig,
    state: ConnectionState,
    generation: u64,
    socket: Option<WsStream>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionHandle {
    pub(crate) fn new(config: &ClientConfig, state_tx: watch::Sender<ConnectionState>) -> Self {
        state_tx.send_replace(ConnectionState::Disconnected);
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
            ws_config: WebSocketConfig::default().max_message_size(Some(config.max_message_size)),
            state: ConnectionState::Disconnected,
            generation: 0,
            socket: None,
            state_tx,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Start a connection attempt if none is live or in flight.
    pub(crate) fn open(&mut self) -> Option<ConnectAttempt> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        debug!(url = %self.url, generation = self.generation, "connection: connecting");
        Some(ConnectAttempt {
            generation: self.generation,
            url: self.url.clone(),
            timeout: self.connect_timeout,
            ws_config: self.ws_config,
        })
    }

    /// Take the result of an attempt. `true` when the handle is now Open.
    pub(crate) fn accept(&mut self, generation: u64, result: Result<WsStream, ConnectError>) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, current = self.generation, "connection: stale connect result dropped");
            return false;
        }
        match result {
            Ok(stream) => {
                self.socket = Some(stream);
                self.set_state(ConnectionState::Open);
                info!(url = %self.url, generation, "connection: opened");
                true
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "connection: connect failed");
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Send one frame. Fails immediately unless Open, and gives up once the
    /// write has been blocked for `send_timeout`.
    pub(crate) async fn send(&mut self, msg: Message) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(SendError::NotOpen);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(SendError::NotOpen);
        };
        match tokio::time::timeout(self.send_timeout, socket.send(msg)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SendError::Stalled(self.send_timeout)),
        }
    }

    /// The live socket, for draining the outbound queue.
    pub(crate) fn socket_mut(&mut self) -> Option<&mut WsStream> {
        if self.state == ConnectionState::Open { self.socket.as_mut() } else { None }
    }

    /// Wait for the next event on the live socket. Never resolves without one.
    pub(crate) async fn next_event(&mut self) -> SocketEvent {
        let Some(socket) = self.socket.as_mut() else {
            return std::future::pending().await;
        };
        match socket.next().await {
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "connection: peer sent close");
                SocketEvent::Closed
            }
            Some(Ok(msg)) => SocketEvent::Frame(msg),
            Some(Err(e)) => {
                warn!(error = %e, "connection: read failed");
                SocketEvent::Closed
            }
            None => SocketEvent::Closed,
        }
    }

    /// Drop the socket after a transport failure or a peer close.
    pub(crate) fn lost(&mut self) {
        if self.socket.take().is_some() {
            info!(url = %self.url, "connection: closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close deliberately. Also invalidates an attempt still in flight.
    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.generation += 1;
        if let Some(mut socket) = self.socket.take() {
            match tokio::time::timeout(self.send_timeout, socket.close(None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "connection: close handshake failed"),
                Err(_) => debug!("connection: close handshake timed out"),
            }
            info!(url = %self.url, "connection: closed by client");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
