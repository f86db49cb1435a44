//! Wire envelopes exchanged between client and server.
//!
//! Two message shapes cross the socket, both JSON bodies inside
//! Content-Length frames (see [`crate::framing`]):
//!
//! ```text
//! call:     {"id":7,"method":"jobs.list","params":[{"limit":100}]}
//! response: {"id":7,"method":"jobs.list","result":[...]}
//! response: {"id":7,"method":"jobs.list","error":{"name":"Error","message":"boom"}}
//! ```
//!
//! Exactly one of `result`/`error` is present in a response; the absent one
//! is omitted from the wire entirely. Correlation is by `id` alone; `method`
//! is echoed back for logging and debugging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A call request: one per `Client::call` invocation.
///
/// `id` is unique among the issuing client's currently-pending calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Correlation token, unique per outstanding call on one connection.
    pub id: u64,
    /// Target method name.
    pub method: String,
    /// Positional arguments, passed through to the handler unchanged.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A response to a previously received [`CallEnvelope`].
///
/// The server never originates a response whose `id` it did not receive in a
/// call first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation token copied from the originating call.
    pub id: u64,
    /// Method name copied from the originating call.
    pub method: String,
    /// Handler return value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Handler failure on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponseEnvelope {
    /// Build a success response for the given call.
    pub fn success(call: &CallEnvelope, result: Value) -> Self {
        Self {
            id: call.id,
            method: call.method.clone(),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for the given call.
    pub fn failure(call: &CallEnvelope, error: ErrorPayload) -> Self {
        Self {
            id: call.id,
            method: call.method.clone(),
            result: None,
            error: Some(error),
        }
    }
}

/// Serialized handler failure: a fixed schema independent of how the handler
/// represented its error natively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error class name (defaults to `"Error"` for untyped failures).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional cause chain / backtrace text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Additional structured fields attached by the handler.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl ErrorPayload {
    /// Build a payload with just a name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a structured field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorPayload {}

impl From<anyhow::Error> for ErrorPayload {
    fn from(err: anyhow::Error) -> Self {
        // A handler that failed with an ErrorPayload keeps its own name and
        // fields; anything else becomes a generic "Error" with the cause
        // chain recorded in `stack`.
        match err.downcast::<ErrorPayload>() {
            Ok(payload) => payload,
            Err(err) => {
                let stack = if err.chain().count() > 1 {
                    Some(format!("{err:?}"))
                } else {
                    None
                };
                Self {
                    name: "Error".to_string(),
                    message: err.to_string(),
                    stack,
                    fields: serde_json::Map::new(),
                }
            }
        }
    }
}
