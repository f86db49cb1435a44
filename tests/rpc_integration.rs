//! Integration tests for client-server RPC over Unix domain sockets.
//!
//! Each test runs a real [`Server`] and [`Client`] in-process against a
//! per-test socket root, exercising the full stack: framing, envelopes,
//! pending-call correlation, timeouts, and cancellation-on-disconnect.
//!
//! # Running
//!
//! ```bash
//! cargo test --test rpc_integration -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use ipc_call::{CallContext, Client, ErrorPayload, IpcConfig, MethodRegistry, RpcError, Server};

/// Opt-in log output: `RUST_LOG=ipc_call=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Short deadlines so timeout-path tests stay fast: 100ms * 4 = 400ms.
fn test_config(root: &TempDir) -> IpcConfig {
    IpcConfig::default()
        .with_retry(Duration::from_millis(100))
        .with_max_retries(3)
        .with_socket_root(root.path())
}

/// The registry used by the original test suite: one method echoing a fixed
/// response, one that always fails.
fn basic_registry() -> MethodRegistry {
    MethodRegistry::builder()
        .method("eventName", |params: Vec<Value>, _ctx| async move {
            assert_eq!(params[0], json!({"message": "message"}));
            Ok(json!({"result": "return"}))
        })
        .method("errorName", |_params, _ctx| async move {
            Err(anyhow::anyhow!("x"))
        })
        .build()
}

#[tokio::test]
async fn call_resolves_with_handler_result() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("basic", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("basic", test_config(&dir));
    let result = client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("call should resolve");
    assert_eq!(result, json!({"result": "return"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn handler_error_rejects_call_with_matching_message() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("errors", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("errors", test_config(&dir));
    let err = client.call("errorName", vec![]).await.unwrap_err();
    let payload = err.handler_payload().expect("handler error");
    assert_eq!(payload.name, "Error");
    assert_eq!(payload.message, "x");

    // A failed handler must not destabilize the server.
    let result = client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("server still serving");
    assert_eq!(result, json!({"result": "return"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn typed_handler_error_preserves_name_and_fields() {
    let registry = MethodRegistry::builder()
        .method("lookup", |_params, _ctx| async move {
            Err(anyhow::Error::new(
                ErrorPayload::new("NotFound", "no such record").with_field("pk", json!(42)),
            ))
        })
        .build();

    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("typed-errors", registry, test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("typed-errors", test_config(&dir));
    let err = client.call("lookup", vec![]).await.unwrap_err();
    let payload = err.handler_payload().expect("handler error");
    assert_eq!(payload.name, "NotFound");
    assert_eq!(payload.message, "no such record");
    assert_eq!(payload.fields.get("pk"), Some(&json!(42)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn unknown_method_times_out_instead_of_erroring() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("unknown", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("unknown", test_config(&dir));
    let started = std::time::Instant::now();
    let err = client.call("noSuchMethod", vec![]).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(err, RpcError::CallTimeout { .. }),
        "expected CallTimeout, got: {err}"
    );
    // Must wait out the full deadline, not fail early with anything
    // method-specific.
    assert!(
        elapsed >= Duration::from_millis(380),
        "rejected too early: {elapsed:?}"
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn call_timeout_invalidates_connection_and_next_call_reconnects() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("revive", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("revive", test_config(&dir));
    let err = client.call("noSuchMethod", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout { .. }));

    // The timed-out connection was forgotten; this call reconnects.
    let result = client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("reconnect and resolve");
    assert_eq!(result, json!({"result": "return"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn concurrent_calls_resolve_out_of_order_by_id() {
    let registry = MethodRegistry::builder()
        .method("slow", |_params, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(json!("slow"))
        })
        .method("fast", |_params, _ctx| async move { Ok(json!("fast")) })
        .build();

    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir).with_retry(Duration::from_millis(200));
    let server = Server::new("concurrent", registry, config.clone());
    server.listen().await.expect("listen");

    let client = Arc::new(Client::new("concurrent", config));
    let slow_client = client.clone();
    let slow = tokio::spawn(async move { slow_client.call("slow", vec![]).await });
    // Give the slow call a head start so both are in flight together.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = client.call("fast", vec![]).await.expect("fast call");
    assert_eq!(fast, json!("fast"));

    // The slow handler must not have been blocked by the fast dispatch, nor
    // the fast response misdelivered to the slow call's slot.
    let slow = slow.await.expect("join").expect("slow call");
    assert_eq!(slow, json!("slow"));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn close_rejects_pending_calls_with_socket_closed() {
    let registry = MethodRegistry::builder()
        .method("hang", |_params, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        })
        .build();

    let dir = TempDir::new().expect("tempdir");
    // Long deadline: the rejection must come from close(), not the timer.
    let config = IpcConfig::default()
        .with_retry(Duration::from_secs(5))
        .with_max_retries(1)
        .with_socket_root(dir.path());
    let server = Server::new("hangs", registry, config.clone());
    server.listen().await.expect("listen");

    let client = Arc::new(Client::new("hangs", config));
    let pending_client = client.clone();
    let pending = tokio::spawn(async move { pending_client.call("hang", vec![]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close().await;

    let err = pending.await.expect("join").unwrap_err();
    assert!(
        matches!(err, RpcError::SocketClosed),
        "expected SocketClosed, got: {err}"
    );

    server.close().await;
}

#[tokio::test]
async fn unexpected_server_close_rejects_pending_calls() {
    let registry = MethodRegistry::builder()
        .method("hang", |_params, mut ctx: CallContext| async move {
            ctx.ended().await;
            Ok(Value::Null)
        })
        .build();

    let dir = TempDir::new().expect("tempdir");
    let config = IpcConfig::default()
        .with_retry(Duration::from_secs(5))
        .with_max_retries(1)
        .with_socket_root(dir.path());
    let server = Server::new("vanishes", registry, config.clone());
    server.listen().await.expect("listen");

    let client = Arc::new(Client::new("vanishes", config));
    let pending_client = client.clone();
    let pending = tokio::spawn(async move { pending_client.call("hang", vec![]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Server goes away with the call still outstanding.
    server.close().await;

    let err = pending.await.expect("join").unwrap_err();
    assert!(
        matches!(err, RpcError::SocketClosed),
        "expected SocketClosed, got: {err}"
    );

    client.close().await;
}

#[tokio::test]
async fn connection_count_tracks_connect_and_close() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("counted", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");
    assert_eq!(server.connection_count().expect("count"), 0);

    let client = Client::new("counted", test_config(&dir));
    client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("call");
    assert_eq!(server.connection_count().expect("count"), 1);

    client.close().await;
    // Let the server notice the disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count().expect("count"), 0);

    server.close().await;
}

#[tokio::test]
async fn client_close_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("reclose", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let client = Client::new("reclose", test_config(&dir));
    client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("call");

    client.close().await;
    client.close().await;

    server.close().await;
    server.close().await;
}

#[tokio::test]
async fn deferred_handler_observes_cancellation_on_disconnect() {
    init_tracing();
    let observed = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicBool::new(false));

    let observed_in_handler = observed.clone();
    let completed_in_handler = completed.clone();
    let registry = MethodRegistry::builder()
        .method("ping", |_params, _ctx| async move { Ok(json!("pong")) })
        .method("deferred", move |_params, mut ctx: CallContext| {
            let observed = observed_in_handler.clone();
            let completed = completed_in_handler.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        completed.store(true, Ordering::SeqCst);
                        Ok(json!("too late"))
                    }
                    _ = ctx.ended() => {
                        observed.store(true, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                }
            }
        })
        .build();

    let dir = TempDir::new().expect("tempdir");
    let config = IpcConfig::default()
        .with_retry(Duration::from_secs(5))
        .with_max_retries(1)
        .with_socket_root(dir.path());
    let server = Server::new("cancels", registry, config.clone());
    server.listen().await.expect("listen");

    let client = Arc::new(Client::new("cancels", config.clone()));
    let pending_client = client.clone();
    let pending = tokio::spawn(async move { pending_client.call("deferred", vec![]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Consumer exits mid-call: the handler must see the end signal instead
    // of firing its timer against a dead connection.
    client.close().await;
    let err = pending.await.expect("join").unwrap_err();
    assert!(matches!(err, RpcError::SocketClosed));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        observed.load(Ordering::SeqCst),
        "handler never observed the end signal"
    );
    assert!(
        !completed.load(Ordering::SeqCst),
        "handler ran to completion despite disconnect"
    );

    // The server must have survived and still serve new clients.
    let second = Client::new("cancels", config);
    let pong = second.call("ping", vec![]).await.expect("server survived");
    assert_eq!(pong, json!("pong"));
    second.close().await;
    server.close().await;
}

#[tokio::test]
async fn connect_to_absent_server_times_out() {
    let dir = TempDir::new().expect("tempdir");
    let client = Client::new("nobody-home", test_config(&dir));

    let started = std::time::Instant::now();
    let err = client.call("anything", vec![]).await.unwrap_err();
    assert!(
        matches!(err, RpcError::ConnectTimeout { .. }),
        "expected ConnectTimeout, got: {err}"
    );
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn concurrent_calls_share_one_connect_attempt() {
    let dir = TempDir::new().expect("tempdir");
    let config = IpcConfig::default()
        .with_retry(Duration::from_millis(100))
        .with_max_retries(1)
        .with_socket_root(dir.path());
    let client = Arc::new(Client::new("nobody-home", config));

    let started = std::time::Instant::now();
    let racer = client.clone();
    let first = tokio::spawn(async move { racer.call("anything", vec![]).await });
    // Let the first call claim the attempt before the second joins it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = client.call("anything", vec![]).await;
    let first = first.await.expect("join");
    let elapsed = started.elapsed();

    assert!(matches!(first.unwrap_err(), RpcError::ConnectTimeout { .. }));
    assert!(matches!(second.unwrap_err(), RpcError::ConnectTimeout { .. }));
    // Both callers rode one retry window; back-to-back attempts would have
    // taken at least two.
    assert!(
        elapsed < Duration::from_millis(180),
        "connect attempts ran back to back: {elapsed:?}"
    );
}

#[tokio::test]
async fn connect_succeeds_after_failed_attempt() {
    let dir = TempDir::new().expect("tempdir");
    let client = Client::new("late-riser", test_config(&dir));

    let err = client.call("eventName", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectTimeout { .. }));

    // Server appears after the failure; the cleared memo lets the next call
    // connect fresh.
    let server = Server::new("late-riser", basic_registry(), test_config(&dir));
    server.listen().await.expect("listen");

    let result = client
        .call("eventName", vec![json!({"message": "message"})])
        .await
        .expect("call after server appears");
    assert_eq!(result, json!({"result": "return"}));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn client_connects_while_server_binds_late_within_window() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);

    // Start the call first; the server binds 150ms later, inside the
    // client's 400ms retry window.
    let call_client = Arc::new(Client::new("slow-start", config.clone()));
    let racing = call_client.clone();
    let call = tokio::spawn(async move {
        racing
            .call("eventName", vec![json!({"message": "message"})])
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let server = Server::new("slow-start", basic_registry(), config);
    server.listen().await.expect("listen");

    let result = call.await.expect("join").expect("call resolves");
    assert_eq!(result, json!({"result": "return"}));

    call_client.close().await;
    server.close().await;
}

#[tokio::test]
async fn multiple_clients_share_one_server() {
    let registry = MethodRegistry::builder()
        .method("whoami", |params: Vec<Value>, _ctx| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        })
        .build();

    let dir = TempDir::new().expect("tempdir");
    let server = Server::new("shared", registry, test_config(&dir));
    server.listen().await.expect("listen");

    let a = Client::new("shared", test_config(&dir));
    let b = Client::new("shared", test_config(&dir));

    let (ra, rb) = tokio::join!(
        a.call("whoami", vec![json!("a")]),
        b.call("whoami", vec![json!("b")])
    );
    assert_eq!(ra.expect("a"), json!("a"));
    assert_eq!(rb.expect("b"), json!("b"));
    assert_eq!(server.connection_count().expect("count"), 2);

    a.close().await;
    b.close().await;
    server.close().await;
}
