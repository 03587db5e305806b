//! Connection object (§4.5.2): pending-call correlation, a single send
//! mutex, a read loop that dispatches requests/notifications and resolves
//! pending calls from responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use control_proto::jsonrpc::{classify, Classified, RawMessage, RequestId, RpcErrorObject};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::errors::ConnectionError;
use crate::registry::HandlerRegistry;
use crate::transport::ObjectStream;

enum PendingOutcome {
    Ok(Value),
    Err(RpcErrorObject),
}

/// One peer connection: a transport, a handler registry, and whatever
/// per-connection application state (`C`) the registered handlers need.
/// `C` must be `Clone` — each dispatched handler call gets its own copy
/// (typically a cheap `Arc` wrapper).
pub struct Connection<C> {
    transport: Arc<dyn ObjectStream>,
    registry: Arc<HandlerRegistry<C>>,
    state: C,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<PendingOutcome>>>,
    send_lock: AsyncMutex<()>,
    closed: AtomicBool,
    read_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<C: Clone + Send + Sync + 'static> Connection<C> {
    #[must_use]
    pub fn new(transport: Arc<dyn ObjectStream>, registry: Arc<HandlerRegistry<C>>, state: C) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            state,
            pending: Mutex::new(HashMap::new()),
            send_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
            read_task: AsyncMutex::new(None),
        })
    }

    /// Idempotent: opens the transport and spawns the read loop exactly once.
    pub async fn open(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), ConnectionError> {
        let mut read_task = self.read_task.lock().await;
        if read_task.is_some() {
            return Ok(());
        }
        self.transport.open().await?;
        let conn = Arc::clone(self);
        *read_task = Some(tokio::spawn(async move { run_read_loop(conn, cancel).await }));
        Ok(())
    }

    /// Idempotent: marks closed, drains pending calls (unblocking waiters
    /// with [`ConnectionError::Closed`]), then closes the transport.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pending.lock().expect("connection mutex poisoned").clear();
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        self.transport.close().await?;
        Ok(())
    }

    /// Whether `close` has run, either via an explicit call or because the
    /// read loop observed a transport error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for its response, or for `cancel`.
    pub async fn call(&self, cancel: CancellationToken, method: &str, params: Option<Value>) -> Result<Value, ConnectionError> {
        let id = RequestId::Str(Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();

        {
            let _send_guard = self.send_lock.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            self.pending.lock().expect("connection mutex poisoned").insert(id.clone(), tx);
            if let Err(err) = self.transport.write(RawMessage::request(id.clone(), method, params)).await {
                self.pending.lock().expect("connection mutex poisoned").remove(&id);
                let _ = self.close().await;
                return Err(err.into());
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.pending.lock().expect("connection mutex poisoned").remove(&id);
                Err(ConnectionError::Cancelled)
            }
            outcome = rx => match outcome {
                Ok(PendingOutcome::Ok(result)) => Ok(result),
                Ok(PendingOutcome::Err(error)) => Err(ConnectionError::Remote(error)),
                Err(_recv_closed) => Err(ConnectionError::Closed),
            },
        }
    }

    /// Sends a notification; no response is awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        let _send_guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if let Err(err) = self.transport.write(RawMessage::notification(method, params)).await {
            let _ = self.close().await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn write_locked(&self, msg: RawMessage) {
        let _send_guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.transport.write(msg).await {
            warn!(error = %err, "failed to write response, closing connection");
            let _ = self.close().await;
        }
    }

    fn resolve_pending(&self, id: RequestId, outcome: PendingOutcome) {
        let sender = self.pending.lock().expect("connection mutex poisoned").remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => trace!(id = %id, "response for unknown or already-resolved call"),
        }
    }
}

async fn run_read_loop<C: Clone + Send + Sync + 'static>(conn: Arc<Connection<C>>, cancel: CancellationToken) {
    loop {
        let read_result = tokio::select! {
            () = cancel.cancelled() => break,
            result = conn.transport.read() => result,
        };

        match read_result {
            Ok(raw) => dispatch(&conn, raw).await,
            Err(err) => {
                warn!(error = %err, "transport read failed, closing connection");
                let _ = conn.close().await;
                break;
            }
        }
    }
}

async fn dispatch<C: Clone + Send + Sync + 'static>(conn: &Arc<Connection<C>>, raw: RawMessage) {
    match classify(raw) {
        Classified::Request { id, method, params } => {
            match conn.registry.lookup(&method) {
                None => conn.write_locked(RawMessage::response_err(id, RpcErrorObject::method_not_found(&method))).await,
                Some(dispatch) if dispatch.is_spawned() => {
                    let conn = Arc::clone(conn);
                    let state = conn.state.clone();
                    tokio::spawn(async move {
                        let result = dispatch.invoke(state, params).await;
                        conn.write_locked(to_response(id, result)).await;
                    });
                }
                Some(dispatch) => {
                    let result = dispatch.invoke(conn.state.clone(), params).await;
                    conn.write_locked(to_response(id, result)).await;
                }
            }
        }
        Classified::Notification { method, params } => match conn.registry.lookup(&method) {
            None => trace!(method = %method, "notification for unregistered method, dropping"),
            Some(dispatch) if dispatch.is_spawned() => {
                let state = conn.state.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatch.invoke(state, params).await {
                        warn!(error = ?err, "async notification handler failed");
                    }
                });
            }
            Some(dispatch) => {
                if let Err(err) = dispatch.invoke(conn.state.clone(), params).await {
                    warn!(error = ?err, "notification handler failed");
                }
            }
        },
        Classified::ResponseOk { id, result } => conn.resolve_pending(id, PendingOutcome::Ok(result)),
        Classified::ResponseErr { id, error } => conn.resolve_pending(id, PendingOutcome::Err(error)),
        Classified::Malformed => trace!("dropping malformed message"),
    }
}

fn to_response(id: RequestId, result: Result<Value, RpcErrorObject>) -> RawMessage {
    match result {
        Ok(value) => RawMessage::response_ok(id, value),
        Err(error) => RawMessage::response_err(id, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Loopback transport: writes on one end land as reads on the peer end.
    struct PairedTransport {
        outbox: mpsc::Sender<RawMessage>,
        inbox: AsyncMutex<mpsc::Receiver<RawMessage>>,
    }

    fn paired() -> (PairedTransport, PairedTransport) {
        let (a_tx, a_rx) = mpsc::channel(32);
        let (b_tx, b_rx) = mpsc::channel(32);
        (
            PairedTransport { outbox: a_tx, inbox: AsyncMutex::new(b_rx) },
            PairedTransport { outbox: b_tx, inbox: AsyncMutex::new(a_rx) },
        )
    }

    #[async_trait]
    impl ObjectStream for PairedTransport {
        async fn open(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn read(&self) -> Result<RawMessage, TransportError> {
            self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
        }
        async fn write(&self, msg: RawMessage) -> Result<(), TransportError> {
            self.outbox.send(msg).await.map_err(|_| TransportError::Closed)
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn call_round_trips_through_registered_handler() {
        let (client_transport, server_transport) = paired();

        let client_registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new());
        let client = Connection::new(Arc::new(client_transport), client_registry, ());
        client.open(CancellationToken::new()).await.unwrap();

        let server_registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new());
        server_registry.def("echo", |_ctx, params| async move { Ok(params.unwrap_or(Value::Null)) }).unwrap();
        let server = Connection::new(Arc::new(server_transport), server_registry, ());
        server.open(CancellationToken::new()).await.unwrap();

        let result = client.call(CancellationToken::new(), "echo", Some(json!({"x": 1}))).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn call_to_unregistered_method_returns_method_not_found() {
        let (client_transport, server_transport) = paired();
        let client = Connection::new(Arc::new(client_transport), Arc::new(HandlerRegistry::new()), ());
        client.open(CancellationToken::new()).await.unwrap();
        let server = Connection::new(Arc::new(server_transport), Arc::new(HandlerRegistry::<()>::new()), ());
        server.open(CancellationToken::new()).await.unwrap();

        let err = client.call(CancellationToken::new(), "nope", None).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Remote(e) if e.code == control_proto::jsonrpc::error_codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn close_unblocks_pending_calls() {
        let (client_transport, _server_transport) = paired();
        let client = Connection::new(Arc::new(client_transport), Arc::new(HandlerRegistry::<()>::new()), ());
        client.open(CancellationToken::new()).await.unwrap();

        let client_for_call = Arc::clone(&client);
        let call_task = tokio::spawn(async move { client_for_call.call(CancellationToken::new(), "whatever", None).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.close().await.unwrap();

        let result = call_task.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn notify_does_not_register_a_pending_call() {
        let (client_transport, server_transport) = paired();
        let notified = Arc::new(tokio::sync::Notify::new());
        let notified_clone = Arc::clone(&notified);

        let server_registry: Arc<HandlerRegistry<()>> = Arc::new(HandlerRegistry::new());
        server_registry
            .def("ping", move |_ctx, _params| {
                let notified = Arc::clone(&notified_clone);
                async move {
                    notified.notify_one();
                    Ok(Value::Null)
                }
            })
            .unwrap();
        let server = Connection::new(Arc::new(server_transport), server_registry, ());
        server.open(CancellationToken::new()).await.unwrap();

        let client = Connection::new(Arc::new(client_transport), Arc::new(HandlerRegistry::new()), ());
        client.open(CancellationToken::new()).await.unwrap();

        client.notify("ping", None).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(200), notified.notified()).await.unwrap();
        assert!(client.pending.lock().unwrap().is_empty());
    }
}
