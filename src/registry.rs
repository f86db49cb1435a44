//! Method registry and handler invocation context.
//!
//! A [`MethodRegistry`] maps method names to async handlers with one uniform
//! signature, fixed at registration time:
//!
//! ```ignore
//! use ipc_call::{CallContext, MethodRegistry};
//! use serde_json::{json, Value};
//!
//! let registry = MethodRegistry::builder()
//!     .method("echo", |params: Vec<Value>, _ctx: CallContext| async move {
//!         Ok(params.into_iter().next().unwrap_or(Value::Null))
//!     })
//!     .build();
//! ```
//!
//! Handlers receive their positional arguments plus a [`CallContext`], the
//! explicit capability for observing early termination of the connection
//! that issued the call. The registry is immutable once built.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

/// Outcome of a handler invocation.
///
/// Failures are converted to a [`crate::proto::ErrorPayload`] on the wire;
/// returning an `ErrorPayload` inside the `anyhow::Error` preserves its name
/// and structured fields end to end.
pub type HandlerResult = anyhow::Result<Value>;

type BoxedFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Type-erased handler stored in the registry.
pub type Handler = Arc<dyn Fn(Vec<Value>, CallContext) -> BoxedFuture + Send + Sync>;

/// Cancellation capability handed to every handler invocation.
///
/// The signal fires when the connection that issued the call ends before the
/// handler resolves, or when the server shuts down. Cancellation is
/// cooperative: a handler that never checks still runs to completion, but
/// its response is discarded rather than written to the dead connection.
#[derive(Debug, Clone)]
pub struct CallContext {
    end: watch::Receiver<bool>,
    // Keeps the sender of a detached context alive so `ended()` does not
    // resolve spuriously through sender drop.
    _guard: Option<Arc<watch::Sender<bool>>>,
}

impl CallContext {
    pub(crate) fn new(end: watch::Receiver<bool>) -> Self {
        Self { end, _guard: None }
    }

    /// Context whose end signal never fires; for driving handlers in tests.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            end: rx,
            _guard: Some(Arc::new(tx)),
        }
    }

    /// True once the issuing connection has ended.
    pub fn is_ended(&self) -> bool {
        *self.end.borrow()
    }

    /// Wait until the issuing connection ends.
    ///
    /// Select this against deferred work to stop producing side effects the
    /// moment the consumer is gone:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     _ = tokio::time::sleep(delay) => finish_work(),
    ///     _ = ctx.ended() => return Ok(Value::Null),
    /// }
    /// ```
    pub async fn ended(&mut self) {
        loop {
            if *self.end.borrow_and_update() {
                return;
            }
            if self.end.changed().await.is_err() {
                // Sender dropped: the connection state is gone entirely.
                return;
            }
        }
    }
}

/// Immutable mapping from method name to handler.
///
/// Owned by the server; built once via [`MethodRegistry::builder`].
pub struct MethodRegistry {
    methods: HashMap<String, Handler>,
}

impl MethodRegistry {
    /// Start building a registry.
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder {
            methods: HashMap::new(),
        }
    }

    /// Look up a handler by method name.
    pub fn get(&self, method: &str) -> Option<&Handler> {
        self.methods.get(method)
    }

    /// True if `method` is registered.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True if no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &names)
            .finish()
    }
}

/// Builder enforcing the uniform handler signature at registration time.
pub struct MethodRegistryBuilder {
    methods: HashMap<String, Handler>,
}

impl MethodRegistryBuilder {
    /// Register `handler` under `name`.
    ///
    /// Registering the same name twice replaces the earlier handler; the
    /// last registration wins.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = name.into();
        let boxed: Handler = Arc::new(move |params, ctx| Box::pin(handler(params, ctx)));
        if self.methods.insert(name.clone(), boxed).is_some() {
            tracing::debug!(method = %name, "replacing previously registered handler");
        }
        self
    }

    /// Finish building.
    pub fn build(self) -> MethodRegistry {
        MethodRegistry {
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn registered_handler_is_invocable() {
        let registry = MethodRegistry::builder()
            .method("sum", |params, _ctx| async move {
                let total: i64 = params.iter().filter_map(Value::as_i64).sum();
                Ok(json!(total))
            })
            .build();

        let handler = registry.get("sum").expect("registered");
        let result = handler(vec![json!(2), json!(3)], CallContext::detached())
            .await
            .expect("handler ok");
        assert_eq!(result, json!(5));
    }

    #[test]
    fn unknown_method_lookup_is_none() {
        let registry = MethodRegistry::builder().build();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let registry = MethodRegistry::builder()
            .method("m", |_p, _c| async { Ok(json!(1)) })
            .method("m", |_p, _c| async { Ok(json!(2)) })
            .build();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn context_observes_end_signal() {
        let (tx, rx) = watch::channel(false);
        let mut ctx = CallContext::new(rx);
        assert!(!ctx.is_ended());

        tx.send(true).expect("receiver alive");
        ctx.ended().await;
        assert!(ctx.is_ended());
    }

    #[tokio::test]
    async fn detached_context_never_ends() {
        let mut ctx = CallContext::detached();
        let fired = tokio::time::timeout(std::time::Duration::from_millis(20), ctx.ended())
            .await
            .is_ok();
        assert!(!fired, "detached context must not signal end");
    }
}
