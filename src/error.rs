//! Error types surfaced by the client.
//!
//! Only [`ClientError`] ever reaches a caller. Transport and parse problems on
//! the inbound side are contained in the driver and show up in logs only.

use std::time::Duration;

use frames::{CodecError, CorrelationId};

/// Failure delivered to a request's caller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No matching response arrived before the deadline.
    #[error("request {id} timed out after {elapsed:?}")]
    Timeout { id: CorrelationId, elapsed: Duration },
    /// The request could not be handed to the transport.
    #[error("send failed: {0}")]
    Send(String),
    /// The request payload could not be encoded as an envelope.
    #[error("request encoding failed: {0}")]
    Codec(#[from] CodecError),
    /// The id is already registered in the pending table.
    #[error("correlation id {0} is already pending")]
    DuplicateId(CorrelationId),
    /// The client driver has stopped.
    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure of a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("websocket connect failed: {0}")]
    Handshake(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket connect timed out after {0:?}")]
    Timeout(Duration),
}
