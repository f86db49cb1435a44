//! RPC client: lazy connection, pending-call table, timeout discipline.
//!
//! A [`Client`] targets a named server endpoint. Connection establishment is
//! deferred until the first [`call`](Client::call) and memoized: overlapping
//! calls share one connect attempt, and a failed or timed-out connection is
//! forgotten so the next call reconnects from scratch.
//!
//! Every outstanding call owns one pending-table slot and one timeout; the
//! slot is released exactly once by whichever of {matching response, timeout,
//! connection close} happens first. Responses are matched to calls by id
//! alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{socket_path_fits, IpcConfig};
use crate::error::RpcError;
use crate::framing::{read_frame, write_frame};
use crate::proto::{CallEnvelope, ResponseEnvelope};

/// Outbound call queue depth per connection.
const CALL_QUEUE_DEPTH: usize = 64;

type PendingSender = oneshot::Sender<Result<ResponseEnvelope, RpcError>>;

/// Pending-call table plus its closed flag, mutated under one lock so each
/// entry is resolved exactly once.
#[derive(Debug, Default)]
struct Pending {
    closed: bool,
    slots: HashMap<u64, PendingSender>,
}

impl Pending {
    /// Reject every pending call and refuse future registrations.
    fn drain(&mut self) {
        self.closed = true;
        for (_, sender) in self.slots.drain() {
            let _ = sender.send(Err(RpcError::SocketClosed));
        }
    }
}

#[derive(Debug)]
struct Connection {
    call_tx: StdMutex<Option<mpsc::Sender<CallEnvelope>>>,
    pending: Arc<StdMutex<Pending>>,
    next_id: AtomicU64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Split the stream and spawn the writer and reader tasks.
    fn spawn(stream: UnixStream) -> Arc<Self> {
        let (read_half, mut write_half) = stream.into_split();
        let pending = Arc::new(StdMutex::new(Pending::default()));

        let (call_tx, mut call_rx) = mpsc::channel::<CallEnvelope>(CALL_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(call) = call_rx.recv().await {
                let body = match serde_json::to_string(&call) {
                    Ok(body) => body,
                    Err(err) => {
                        debug!(id = call.id, error = %err, "call not serializable");
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut write_half, &body).await {
                    debug!(error = %err, "call write failed");
                    break;
                }
            }
            // Dropping the write half sends FIN; the server sees EOF and
            // tears the connection down, which ends our reader too.
        });

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let raw = match read_frame(&mut reader).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => {
                        debug!("connection ended by server");
                        break;
                    }
                    Err(err) => {
                        debug!(error = %err, "connection read failed");
                        break;
                    }
                };
                let response: ResponseEnvelope = match serde_json::from_str(&raw) {
                    Ok(response) => response,
                    Err(err) => {
                        debug!(error = %err, "dropping undecodable response envelope");
                        continue;
                    }
                };
                // Single lookup by correlation id; an id with no slot means
                // the call already timed out or was never ours.
                let slot = reader_pending
                    .lock()
                    .expect("pending lock")
                    .slots
                    .remove(&response.id);
                match slot {
                    Some(sender) => {
                        let _ = sender.send(Ok(response));
                    }
                    None => {
                        debug!(id = response.id, "dropping response with no pending call");
                    }
                }
            }
            reader_pending.lock().expect("pending lock").drain();
        });

        Arc::new(Self {
            call_tx: StdMutex::new(Some(call_tx)),
            pending,
            next_id: AtomicU64::new(1),
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    /// A connection stays usable until its reader drains the table.
    fn is_alive(&self) -> bool {
        !self.pending.lock().expect("pending lock").closed
    }

    /// Register a pending slot for a fresh call id.
    fn register(&self, id: u64, sender: PendingSender) -> Result<(), RpcError> {
        let mut pending = self.pending.lock().expect("pending lock");
        if pending.closed {
            return Err(RpcError::SocketClosed);
        }
        pending.slots.insert(id, sender);
        Ok(())
    }

    /// Remove a pending slot, if the response has not claimed it already.
    fn unregister(&self, id: u64) {
        self.pending.lock().expect("pending lock").slots.remove(&id);
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn sender(&self) -> Result<mpsc::Sender<CallEnvelope>, RpcError> {
        self.call_tx
            .lock()
            .expect("call sender lock")
            .clone()
            .ok_or(RpcError::SocketClosed)
    }

    /// Tear the connection down: reject all pending calls, stop both I/O
    /// tasks, and resolve once the reader has terminated.
    async fn shutdown(&self) {
        self.pending.lock().expect("pending lock").drain();
        // Dropping the call sender ends the writer task and half-closes the
        // stream.
        self.call_tx.lock().expect("call sender lock").take();
        let reader = self.reader_task.lock().await.take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }
}

/// RPC client for a named server endpoint.
///
/// Cheap to clone through `Arc` internally; all methods take `&self`, so one
/// instance can serve many concurrent callers.
///
/// ```ignore
/// use ipc_call::{Client, IpcConfig};
/// use serde_json::json;
///
/// let client = Client::new("worker", IpcConfig::default());
/// let result = client.call("jobs.list", vec![json!({"limit": 100})]).await?;
/// ```
pub struct Client {
    name: String,
    config: IpcConfig,
    timeout: Duration,
    state: StdMutex<ConnState>,
}

/// Connection slot: empty, one in-flight attempt, or an established link.
///
/// Guarded by a synchronous lock that is never held across an await; the
/// attempt itself runs outside the lock and reports through the `watch`
/// channel, so overlapping first calls join one attempt instead of queueing
/// behind each other.
enum ConnState {
    Idle,
    Connecting {
        outcome: watch::Receiver<ConnectOutcome>,
        token: Arc<()>,
    },
    Ready(Arc<Connection>),
}

/// Broadcast from the connecting caller to everyone awaiting the attempt.
#[derive(Clone)]
enum ConnectOutcome {
    Pending,
    Failed,
    Connected(Arc<Connection>),
}

/// What a caller entering [`Client::init`] found in the connection slot.
enum InitPlan {
    Use(Arc<Connection>),
    Wait(watch::Receiver<ConnectOutcome>),
    Lead {
        outcome_tx: watch::Sender<ConnectOutcome>,
        token: Arc<()>,
    },
}

impl Client {
    /// Create a client targeting endpoint `name`.
    ///
    /// No connection is attempted until the first call.
    pub fn new(name: impl Into<String>, config: IpcConfig) -> Self {
        let timeout = config.timeout();
        Self {
            name: name.into(),
            config,
            timeout,
            state: StdMutex::new(ConnState::Idle),
        }
    }

    /// Invoke `method` on the server with positional `params`.
    ///
    /// Establishes the connection first if necessary. Resolves with the
    /// handler's result; rejects with:
    ///
    /// - [`RpcError::Handler`] if the handler failed,
    /// - [`RpcError::CallTimeout`] if no response arrived in time (the
    ///   connection is invalidated so the next call reconnects),
    /// - [`RpcError::SocketClosed`] if the connection closed mid-call,
    /// - [`RpcError::ConnectTimeout`] if no connection could be established.
    ///
    /// A call to a method the server does not register never receives a
    /// response and surfaces as [`RpcError::CallTimeout`].
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let conn = self.init().await?;

        let id = conn.fresh_id();
        let (sender, receiver) = oneshot::channel();
        conn.register(id, sender)?;

        let envelope = CallEnvelope {
            id,
            method: method.to_string(),
            params,
        };
        let call_tx = match conn.sender() {
            Ok(call_tx) => call_tx,
            Err(err) => {
                conn.unregister(id);
                return Err(err);
            }
        };
        if call_tx.send(envelope).await.is_err() {
            conn.unregister(id);
            return Err(RpcError::SocketClosed);
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Ok(response))) => match response.error {
                Some(payload) => Err(RpcError::Handler(payload)),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            // Drained by close or disconnect.
            Ok(Ok(Err(err))) => Err(err),
            // Sender dropped without resolving; treat like a disconnect.
            Ok(Err(_)) => Err(RpcError::SocketClosed),
            Err(_) => {
                conn.unregister(id);
                // A response this late means the connection is suspect;
                // forget it so the next call reconnects.
                self.invalidate(&conn);
                Err(RpcError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Disconnect and reject every pending call with
    /// [`RpcError::SocketClosed`]. Resolves once disconnection is confirmed.
    /// Idempotent.
    pub async fn close(&self) {
        let taken = {
            let mut state = self.state.lock().expect("conn state lock");
            std::mem::replace(&mut *state, ConnState::Idle)
        };
        // Closing mid-attempt just vacates the slot; the connecting caller
        // finds its claim gone and leaves the slot untouched.
        if let ConnState::Ready(conn) = taken {
            conn.shutdown().await;
            if self.config.silent {
                debug!(name = %self.name, "client closed");
            } else {
                info!(name = %self.name, "client closed");
            }
        }
    }

    /// Endpoint name this client targets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the live connection, establishing it if needed.
    ///
    /// Overlapping calls share one in-flight attempt: the first caller runs
    /// the connect loop while the rest await its broadcast outcome, so a
    /// failing attempt costs one retry window however many callers joined
    /// it. A failed attempt vacates the slot and the next call starts over.
    /// A dead connection found here is discarded and replaced the same way.
    async fn init(&self) -> Result<Arc<Connection>, RpcError> {
        let plan = {
            let mut state = self.state.lock().expect("conn state lock");
            match &*state {
                ConnState::Ready(conn) if conn.is_alive() => InitPlan::Use(conn.clone()),
                ConnState::Connecting { outcome, .. } => InitPlan::Wait(outcome.clone()),
                // Idle, or stale: the reader already drained its table.
                _ => {
                    let (outcome_tx, outcome_rx) = watch::channel(ConnectOutcome::Pending);
                    let token = Arc::new(());
                    *state = ConnState::Connecting {
                        outcome: outcome_rx,
                        token: token.clone(),
                    };
                    InitPlan::Lead { outcome_tx, token }
                }
            }
        };

        match plan {
            InitPlan::Use(conn) => Ok(conn),
            InitPlan::Wait(outcome) => self.await_shared_attempt(outcome).await,
            InitPlan::Lead { outcome_tx, token } => self.lead_connect(outcome_tx, token).await,
        }
    }

    /// Wait on a connect attempt some other caller is running.
    async fn await_shared_attempt(
        &self,
        mut outcome: watch::Receiver<ConnectOutcome>,
    ) -> Result<Arc<Connection>, RpcError> {
        loop {
            let current = outcome.borrow_and_update().clone();
            match current {
                ConnectOutcome::Connected(conn) => return Ok(conn),
                ConnectOutcome::Failed => return Err(self.connect_timeout()),
                ConnectOutcome::Pending => {
                    // A dropped sender means the connecting caller went away
                    // without reporting; count it as a failure.
                    if outcome.changed().await.is_err() {
                        return Err(self.connect_timeout());
                    }
                }
            }
        }
    }

    /// Run the connect loop and broadcast its outcome to waiting callers.
    async fn lead_connect(
        &self,
        outcome_tx: watch::Sender<ConnectOutcome>,
        token: Arc<()>,
    ) -> Result<Arc<Connection>, RpcError> {
        match self.connect_with_retry().await {
            Ok(stream) => {
                if self.config.silent {
                    debug!(name = %self.name, "connected");
                } else {
                    info!(name = %self.name, "connected");
                }
                let conn = Connection::spawn(stream);
                self.settle_attempt(&token, Some(conn.clone()));
                let _ = outcome_tx.send(ConnectOutcome::Connected(conn.clone()));
                Ok(conn)
            }
            Err(err) => {
                self.settle_attempt(&token, None);
                let _ = outcome_tx.send(ConnectOutcome::Failed);
                Err(err)
            }
        }
    }

    /// Install the attempt's result, unless [`close`](Self::close) already
    /// reclaimed the slot while the attempt was in flight.
    fn settle_attempt(&self, token: &Arc<()>, conn: Option<Arc<Connection>>) {
        let mut state = self.state.lock().expect("conn state lock");
        let ours = matches!(
            &*state,
            ConnState::Connecting { token: current, .. } if Arc::ptr_eq(current, token)
        );
        if ours {
            *state = match conn {
                Some(conn) => ConnState::Ready(conn),
                None => ConnState::Idle,
            };
        }
    }

    fn connect_timeout(&self) -> RpcError {
        RpcError::ConnectTimeout {
            name: self.name.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Attempt to connect, pacing attempts `retry` apart, up to
    /// `max_retries + 1` attempts.
    ///
    /// The server may not have bound its endpoint yet, so refused attempts
    /// are retried. There is no sleep after the last refusal: a run of
    /// instant failures returns after about `retry * max_retries`, always
    /// inside the `retry * (max_retries + 1)` deadline the error reports.
    async fn connect_with_retry(&self) -> Result<UnixStream, RpcError> {
        let path = self.config.socket_path(&self.name);
        if !socket_path_fits(&path) {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "socket path {} exceeds the platform sun_path limit",
                    path.display()
                ),
            )));
        }

        let attempts = self.config.max_retries + 1;
        let connect_loop = async {
            for attempt in 1..=attempts {
                match UnixStream::connect(&path).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        debug!(
                            name = %self.name,
                            attempt,
                            error = %err,
                            "connect attempt failed"
                        );
                        if attempt < attempts {
                            tokio::time::sleep(self.config.retry).await;
                        }
                    }
                }
            }
            Err(self.connect_timeout())
        };

        tokio::time::timeout(self.timeout, connect_loop)
            .await
            .map_err(|_| self.connect_timeout())?
    }

    /// Forget `conn` if it is still the memoized connection, forcing the
    /// next call to reconnect. A newer connection is left untouched.
    ///
    /// The forgotten connection is not torn down: calls still pending on it
    /// keep their own timers and may yet resolve. Once the last of them
    /// settles the writer drops, the stream half-closes, and both I/O tasks
    /// unwind on their own.
    fn invalidate(&self, conn: &Arc<Connection>) {
        let mut state = self.state.lock().expect("conn state lock");
        let ours = matches!(
            &*state,
            ConnState::Ready(current) if Arc::ptr_eq(current, conn)
        );
        if ours {
            *state = ConnState::Idle;
        }
    }
}
