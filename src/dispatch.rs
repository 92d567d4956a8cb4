//! Inbound frame dispatch.
//!
//! Every inbound data frame ends in exactly one [`DispatchOutcome`]. Only
//! `Resolved` touches a caller; the other outcomes are logged and dropped.
//! Nothing here returns an error: a bad frame from the peer must never fail an
//! unrelated request.

use frames::{CodecError, CorrelationId, Envelope};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::pending::PendingTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Matched a pending request, which now holds the full payload.
    Resolved(CorrelationId),
    /// Carried a correlation id that no pending request owns (late, or never ours).
    Unsolicited(CorrelationId),
    /// Parsed, but had no recognizable `requestid`.
    Uncorrelated,
    /// Could not be decoded as an envelope.
    Malformed(String),
}

/// Route one websocket message. `None` for control frames (ping/pong/close).
pub(crate) fn dispatch_message(msg: &Message, pending: &mut PendingTable) -> Option<DispatchOutcome> {
    let decoded = match msg {
        Message::Text(text) => frames::decode_envelope(text.as_str()),
        Message::Binary(bytes) => frames::decode_envelope_bytes(bytes),
        _ => return None,
    };
    Some(route(decoded, pending))
}

fn route(decoded: Result<Envelope, CodecError>, pending: &mut PendingTable) -> DispatchOutcome {
    let envelope = match decoded {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "dispatch: malformed inbound frame discarded");
            return DispatchOutcome::Malformed(e.to_string());
        }
    };

    let Some(id) = envelope.request_id else {
        warn!(keys = ?envelope.body.keys().collect::<Vec<_>>(), "dispatch: uncorrelated frame discarded");
        return DispatchOutcome::Uncorrelated;
    };

    if pending.resolve(id, envelope.into_value()) {
        debug!(%id, "dispatch: response delivered");
        DispatchOutcome::Resolved(id)
    } else {
        warn!(%id, "dispatch: unsolicited frame discarded");
        DispatchOutcome::Unsolicited(id)
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
