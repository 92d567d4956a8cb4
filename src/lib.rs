//! Request/response client over a single WebSocket.
//!
//! Turns one bidirectional, frame-based connection into a request/response
//! API: each request is stamped with a fresh `requestid`, tracked until the
//! peer echoes that id back or a deadline passes, and replayed in order over a
//! fresh connection if it was submitted while disconnected.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = wsreq::ClientConfig::new("ws://127.0.0.1:9000/rpc")?;
//! let client = wsreq::Client::new(config);
//!
//! let reply = client.request(&serde_json::json!({ "op": "ping" })).await?;
//! client.send_message(&serde_json::json!({ "op": "bye" }))?;
//! # drop(reply);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod correlation;
mod dispatch;
mod error;
mod outbound;
mod pending;

pub use client::{Client, ClientStats, PendingResponse};
pub use config::{
    ClientConfig, ConfigError, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SEND_TIMEOUT_MS,
};
pub use connection::ConnectionState;
pub use correlation::IdGenerator;
pub use dispatch::DispatchOutcome;
pub use error::{ClientError, ConnectError};
pub use frames::{CodecError, CorrelationId, REQUEST_ID_FIELD, SENT_FIELD};
