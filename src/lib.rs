//! Promise-style RPC over Unix domain sockets.
//!
//! One process exposes named methods through a [`Server`]; another invokes
//! them by name with positional arguments through a [`Client`], as if
//! calling a local async function:
//!
//! ```ignore
//! use ipc_call::{Client, IpcConfig, MethodRegistry, Server};
//! use serde_json::{json, Value};
//!
//! let registry = MethodRegistry::builder()
//!     .method("greet", |params: Vec<Value>, _ctx| async move {
//!         let name = params[0].as_str().unwrap_or("world");
//!         Ok(json!(format!("hello, {name}")))
//!     })
//!     .build();
//!
//! let server = Server::new("greeter", registry, IpcConfig::default());
//! server.listen().await?;
//!
//! let client = Client::new("greeter", IpcConfig::default());
//! let reply = client.call("greet", vec![json!("ipc")]).await?;
//! assert_eq!(reply, json!("hello, ipc"));
//! ```
//!
//! # Modules
//!
//! - [`config`] - transport configuration (retry interval, socket root)
//! - [`proto`] - call/response envelopes crossing the socket
//! - [`framing`] - Content-Length message framing
//! - [`registry`] - method registry and handler cancellation context
//! - [`server`] - endpoint binding and handler dispatch
//! - [`client`] - pending-call correlation, timeouts, reconnection
//!
//! # Failure semantics
//!
//! Handler failures are caught on the server, serialized as a structured
//! payload, and rejected on the caller's side as [`RpcError::Handler`]; they
//! never destabilize the server. Calls to unregistered methods are silently
//! dropped and surface to the caller as [`RpcError::CallTimeout`]. When a
//! connection drops mid-call, still-running handlers observe their
//! [`CallContext`] end signal and every pending call rejects with
//! [`RpcError::SocketClosed`].

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod proto;
pub mod registry;
pub mod server;

pub use client::Client;
pub use config::IpcConfig;
pub use error::RpcError;
pub use proto::{CallEnvelope, ErrorPayload, ResponseEnvelope};
pub use registry::{CallContext, HandlerResult, MethodRegistry, MethodRegistryBuilder};
pub use server::Server;
