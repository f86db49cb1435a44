//! RPC server: named endpoint, handler dispatch, response correlation.
//!
//! A [`Server`] binds `<socket_root>/<name>.sock`, accepts any number of
//! client connections, and dispatches incoming [`CallEnvelope`]s to the
//! handlers in its [`MethodRegistry`]. Handler invocations run concurrently;
//! a slow handler never blocks dispatch of other calls.
//!
//! # Lifecycle
//!
//! - [`Server::listen`] ensures the socket directory exists, removes a stale
//!   socket file left by a crashed predecessor, binds, and spawns the accept
//!   loop.
//! - When a connection ends with handlers still running, each handler's
//!   [`CallContext`] end signal fires and any response it still produces is
//!   discarded instead of written to the dead socket.
//! - [`Server::close`] stops accepting, signals end to live connections, and
//!   unlinks the socket file. Closing twice is a no-op.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{socket_path_fits, IpcConfig};
use crate::error::RpcError;
use crate::framing::{read_frame, write_frame};
use crate::proto::{CallEnvelope, ErrorPayload, ResponseEnvelope};
use crate::registry::{CallContext, MethodRegistry};

/// Per-connection response queue depth. Senders await when the peer reads
/// slower than handlers produce.
const RESPONSE_QUEUE_DEPTH: usize = 64;

/// Listening lifecycle. The slot is claimed with `Binding` before the bind
/// itself is awaited, so a second `listen` arriving mid-bind sees the claim
/// instead of binding again over the first one's socket.
enum ListenState {
    Binding(Arc<()>),
    Accepting(Accepting),
}

struct Accepting {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// RPC server bound to a named local endpoint.
pub struct Server {
    name: String,
    config: IpcConfig,
    timeout: Duration,
    registry: Arc<MethodRegistry>,
    state: Mutex<Option<ListenState>>,
    connections: Arc<AtomicUsize>,
}

impl Server {
    /// Create a server for endpoint `name` with the given method registry.
    ///
    /// The endpoint is not bound until [`listen`](Self::listen) is called.
    pub fn new(name: impl Into<String>, registry: MethodRegistry, config: IpcConfig) -> Self {
        let timeout = config.timeout();
        Self {
            name: name.into(),
            config,
            timeout,
            registry: Arc::new(registry),
            state: Mutex::new(None),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the endpoint and start accepting connections.
    ///
    /// Resolves once the endpoint is accepting. Calling `listen` while
    /// already listening is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ListenTimeout`] if binding does not complete
    /// within `retry * (max_retries + 1)`, and [`RpcError::Io`] if the socket
    /// directory cannot be created or the bind itself fails.
    pub async fn listen(&self) -> Result<(), RpcError> {
        // Claim the slot synchronously so a concurrent listen sees it and
        // returns instead of binding a second time over our socket.
        let token = {
            let mut state = self.state.lock().expect("listen state lock");
            if state.is_some() {
                return Ok(());
            }
            let token = Arc::new(());
            *state = Some(ListenState::Binding(token.clone()));
            token
        };

        let socket_path = self.config.socket_path(&self.name);
        let listener = match tokio::time::timeout(self.timeout, self.bind(&socket_path)).await {
            Ok(Ok(listener)) => listener,
            Ok(Err(err)) => {
                self.release_claim(&token);
                return Err(err);
            }
            Err(_) => {
                self.release_claim(&token);
                return Err(RpcError::ListenTimeout {
                    name: self.name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if self.config.silent {
            debug!(name = %self.name, path = %socket_path.display(), "listening");
        } else {
            info!(name = %self.name, path = %socket_path.display(), "listening");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.connections.clone(),
            shutdown_rx,
        ));

        let accepting = Accepting {
            socket_path,
            shutdown: shutdown_tx,
            accept_task,
        };
        let leftover = {
            let mut state = self.state.lock().expect("listen state lock");
            let ours = matches!(
                &*state,
                Some(ListenState::Binding(current)) if Arc::ptr_eq(current, &token)
            );
            if ours {
                *state = Some(ListenState::Accepting(accepting));
                None
            } else {
                // close() reclaimed the slot mid-bind; tear down what we
                // just built instead of installing it.
                Some(accepting)
            }
        };
        if let Some(accepting) = leftover {
            shutdown_accepting(accepting).await;
        }
        Ok(())
    }

    /// Vacate the slot after a failed bind, unless `close` already did.
    fn release_claim(&self, token: &Arc<()>) {
        let mut state = self.state.lock().expect("listen state lock");
        let ours = matches!(
            &*state,
            Some(ListenState::Binding(current)) if Arc::ptr_eq(current, token)
        );
        if ours {
            *state = None;
        }
    }

    async fn bind(&self, socket_path: &Path) -> Result<UnixListener, RpcError> {
        if !socket_path_fits(socket_path) {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "socket path {} exceeds the platform sun_path limit",
                    socket_path.display()
                ),
            )));
        }

        tokio::fs::create_dir_all(&self.config.socket_root).await?;

        // A crashed predecessor leaves the socket file behind and bind would
        // fail with AddrInUse; a live one would too, which we cannot
        // distinguish here, so last-binder-wins like the original transport.
        if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
            debug!(path = %socket_path.display(), "removing stale socket file");
            let _ = tokio::fs::remove_file(socket_path).await;
        }

        Ok(UnixListener::bind(socket_path)?)
    }

    /// Stop accepting connections and terminate live ones.
    ///
    /// Signals end to every in-flight handler, unlinks the socket file, and
    /// resolves once the accept loop has exited. Idempotent.
    pub async fn close(&self) {
        let state = self.state.lock().expect("listen state lock").take();
        match state {
            None => {}
            // Mid-bind: the in-flight listen finds its claim gone and tears
            // its listener down itself.
            Some(ListenState::Binding(_)) => {}
            Some(ListenState::Accepting(accepting)) => {
                shutdown_accepting(accepting).await;
                if self.config.silent {
                    debug!(name = %self.name, "server closed");
                } else {
                    info!(name = %self.name, "server closed");
                }
            }
        }
    }

    /// Current number of live client connections.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotListening`] if the server is not accepting
    /// (never listened, or already closed).
    pub fn connection_count(&self) -> Result<usize, RpcError> {
        if self.state.lock().expect("listen state lock").is_none() {
            return Err(RpcError::NotListening {
                name: self.name.clone(),
            });
        }
        Ok(self.connections.load(Ordering::SeqCst))
    }

    /// Endpoint name this server binds.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Stop the accept loop and unlink the socket file.
async fn shutdown_accepting(accepting: Accepting) {
    let _ = accepting.shutdown.send(true);
    let _ = accepting.accept_task.await;
    let _ = tokio::fs::remove_file(&accepting.socket_path).await;
}

async fn accept_loop(
    listener: UnixListener,
    registry: Arc<MethodRegistry>,
    connections: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let registry = registry.clone();
                        let connections = connections.clone();
                        let shutdown = shutdown.clone();
                        connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            serve_connection(stream, registry, shutdown).await;
                            connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender means the server itself is gone.
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Drive one client connection: read call envelopes, dispatch handlers, and
/// funnel their responses through a single writer task.
async fn serve_connection(
    stream: UnixStream,
    registry: Arc<MethodRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // All concurrently running handlers respond through this queue; the
    // writer task is the only place the socket is written.
    let (response_tx, mut response_rx) = mpsc::channel::<ResponseEnvelope>(RESPONSE_QUEUE_DEPTH);
    let writer_task = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let body = match serde_json::to_string(&response) {
                Ok(body) => body,
                Err(err) => {
                    warn!(id = response.id, error = %err, "response not serializable");
                    continue;
                }
            };
            if let Err(err) = write_frame(&mut write_half, &body).await {
                debug!(error = %err, "response write failed, dropping connection writer");
                break;
            }
        }
    });

    // End signal observed by every CallContext minted for this connection.
    let (end_tx, end_rx) = watch::channel(false);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(raw)) => {
                        dispatch(&raw, &registry, &response_tx, &end_rx);
                    }
                    Ok(None) => {
                        debug!("connection ended by peer");
                        break;
                    }
                    Err(err) => {
                        debug!(error = %err, "connection read failed");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("connection terminated by server close");
                    break;
                }
            }
        }
    }

    // Wake handlers parked on CallContext::ended so they stop scheduled
    // work; their late responses are discarded below via the closed queue.
    let _ = end_tx.send(true);
    drop(response_tx);
    writer_task.abort();
    let _ = writer_task.await;
}

/// Decode one call envelope and spawn its handler.
fn dispatch(
    raw: &str,
    registry: &Arc<MethodRegistry>,
    response_tx: &mpsc::Sender<ResponseEnvelope>,
    end_rx: &watch::Receiver<bool>,
) {
    let mut call: CallEnvelope = match serde_json::from_str(raw) {
        Ok(call) => call,
        Err(err) => {
            debug!(error = %err, "dropping undecodable call envelope");
            return;
        }
    };

    // Unknown method is a deliberate no-op: no error response, the caller's
    // own timeout handles it.
    let Some(handler) = registry.get(&call.method) else {
        debug!(method = %call.method, id = call.id, "dropping call for unknown method");
        return;
    };

    let handler = handler.clone();
    let response_tx = response_tx.clone();
    let ctx = CallContext::new(end_rx.clone());
    let params = std::mem::take(&mut call.params);
    tokio::spawn(async move {
        let response = match handler(params, ctx.clone()).await {
            Ok(result) => ResponseEnvelope::success(&call, result),
            Err(err) => {
                debug!(method = %call.method, id = call.id, error = %err, "handler failed");
                ResponseEnvelope::failure(&call, ErrorPayload::from(err))
            }
        };
        if ctx.is_ended() {
            // The issuing connection is gone; a response now would be a
            // write after disconnect.
            debug!(method = %call.method, id = call.id, "discarding response after connection end");
            return;
        }
        let _ = response_tx.send(response).await;
    });
}
