//! Error taxonomy for the RPC layer.
//!
//! Every failure mode a caller can observe is a variant of [`RpcError`].
//! Handler-side failures travel the wire as a [`crate::proto::ErrorPayload`]
//! and surface on the client as [`RpcError::Handler`].

use thiserror::Error;

use crate::proto::ErrorPayload;

/// RPC-specific error types.
///
/// Timeout variants carry the endpoint or method name and the deadline that
/// expired, so log lines and test assertions stay actionable.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Server failed to bind its endpoint within the configured timeout.
    /// Fatal to that `listen()` invocation; the caller may retry.
    #[error("listen on \"{name}\" timed out after {timeout_ms}ms")]
    ListenTimeout {
        /// Endpoint name.
        name: String,
        /// Deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// Client failed to establish a connection within the configured timeout.
    /// Recoverable: the next call retries connecting from scratch.
    #[error("connect to \"{name}\" timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Endpoint name.
        name: String,
        /// Deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// No response arrived for a call within the configured timeout.
    /// Recoverable: the call may be reissued; the connection is invalidated
    /// so the next call reconnects.
    #[error("call \"{method}\" timed out after {timeout_ms}ms")]
    CallTimeout {
        /// Method name of the timed-out call.
        method: String,
        /// Deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// A registered handler failed; carries the server-reported payload.
    #[error("{0}")]
    Handler(ErrorPayload),

    /// Connection closed (explicitly or unexpectedly) while calls were
    /// outstanding. Every pending call on the connection rejects with this.
    #[error("socket is closed")]
    SocketClosed,

    /// Server-side operation invoked while the server is not accepting.
    #[error("server \"{name}\" is not listening")]
    NotListening {
        /// Endpoint name.
        name: String,
    },

    /// Framing or envelope decoding failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Name/message of the server-reported failure, if this is one.
    pub fn handler_payload(&self) -> Option<&ErrorPayload> {
        match self {
            RpcError::Handler(payload) => Some(payload),
            _ => None,
        }
    }
}
