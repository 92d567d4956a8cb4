//! Shared envelope model and JSON codec for the request/response socket.
//!
//! This crate owns the wire representation used by `wsreq` and its tools.
//! Payloads stay flexible (`serde_json::Map`); the only field the protocol
//! itself understands is the lowercase `requestid` correlation field, plus the
//! `sent` timestamp stamped on every request.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation field carried by requests and echoed back by responses.
///
/// Lowercase on purpose: some peers normalize key casing.
pub const REQUEST_ID_FIELD: &str = "requestid";

/// Submission timestamp field (milliseconds since the Unix epoch).
pub const SENT_FIELD: &str = "sent";

/// Error returned by the encode/decode helpers.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload could not be serialized, or the frame is not valid JSON.
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON, but not the object shape the envelope requires.
    #[error("{0} is not a JSON object")]
    NotAnObject(&'static str),
}

/// Opaque value linking a request to its eventual response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Parsed `requestid`, if present and recognizable.
    pub request_id: Option<CorrelationId>,
    /// The full object as received, `requestid` included.
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Consume the envelope, returning the full payload as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

/// Encode a request payload with its correlation and submission fields.
///
/// The payload must serialize to a JSON object. Caller-supplied `requestid`
/// or `sent` keys are overwritten.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails and
/// [`CodecError::NotAnObject`] for non-object payloads.
pub fn encode_request<T>(id: CorrelationId, sent_ms: i64, payload: &T) -> Result<String, CodecError>
where
    T: Serialize + ?Sized,
{
    let Value::Object(mut body) = serde_json::to_value(payload)? else {
        return Err(CodecError::NotAnObject("request payload"));
    };
    body.insert(REQUEST_ID_FIELD.to_owned(), Value::from(id.get()));
    body.insert(SENT_FIELD.to_owned(), Value::from(sent_ms));
    Ok(serde_json::to_string(&body)?)
}

/// Encode a fire-and-forget payload. No envelope fields are added.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the payload cannot be serialized.
pub fn encode_message<T>(payload: &T) -> Result<String, CodecError>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_string(payload)?)
}

/// Decode an inbound text frame into an [`Envelope`].
///
/// # Errors
///
/// Returns [`CodecError::Json`] for unparsable text and
/// [`CodecError::NotAnObject`] when the frame is not a JSON object.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    decode_value(serde_json::from_str(text)?)
}

/// Decode an inbound binary frame holding UTF-8 JSON.
///
/// # Errors
///
/// Same as [`decode_envelope`].
pub fn decode_envelope_bytes(bytes: &[u8]) -> Result<Envelope, CodecError> {
    decode_value(serde_json::from_slice(bytes)?)
}

fn decode_value(value: Value) -> Result<Envelope, CodecError> {
    let Value::Object(body) = value else {
        return Err(CodecError::NotAnObject("inbound frame"));
    };
    let request_id = body.get(REQUEST_ID_FIELD).and_then(correlation_id_from);
    Ok(Envelope { request_id, body })
}

/// Read a correlation id from a JSON value.
///
/// Accepts an unsigned integer, or a string holding one (peers that stringify
/// numbers). Anything else is unrecognizable.
#[must_use]
pub fn correlation_id_from(value: &Value) -> Option<CorrelationId> {
    match value {
        Value::Number(n) => n.as_u64().map(CorrelationId),
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(n) => Some(CorrelationId(n)),
            Err(_) => None,
        },
        _ => None,
    }
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
