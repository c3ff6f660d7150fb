//! Request/response multiplexer
//!
//! Bound one-to-one to a connected transport. Assigns monotonically
//! increasing `u64` ids to outgoing requests, keeps the id → pending-request
//! map, and runs the dispatch loop that resolves responses, fans out
//! notifications, and fails everything outstanding when the transport
//! closes.
//!
//! Lock discipline: the correlation map sits behind a `std::sync::Mutex`
//! held only across insert/lookup/remove, never across I/O. Result delivery
//! uses one-shot channels owned by the awaiting caller; the map holds only
//! the sending half, so draining the map on close is enough to fail every
//! waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::transport::{Transport, TransportEvent};

use super::protocol::{
    ErrorObject, InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest,
};

/// How a single multiplexed request can fail.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The server answered with a JSON-RPC error object.
    #[error("rpc error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),

    /// The per-request deadline elapsed; a late response will be discarded.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The transport closed while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The write failed; the pending entry was removed before returning.
    #[error("send failed: {0}")]
    Send(String),
}

impl RpcError {
    pub fn into_core(self) -> CoreError {
        match self {
            RpcError::Rpc(obj) => CoreError::Tool {
                code: obj.code,
                message: obj.message,
                data: obj.data,
            },
            RpcError::Timeout { timeout_ms } => CoreError::Timeout(timeout_ms),
            RpcError::ConnectionClosed => CoreError::Connection("connection closed".to_string()),
            RpcError::Send(msg) => CoreError::Connection(format!("send failed: {}", msg)),
        }
    }
}

type PendingSender = oneshot::Sender<Result<serde_json::Value, ErrorObject>>;

/// Callback invoked for every inbound notification.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

struct Shared {
    pending: Mutex<HashMap<u64, PendingSender>>,
    closed: AtomicBool,
}

impl Shared {
    /// Fail every outstanding request by dropping its completion handle.
    fn drain(&self) {
        let drained: Vec<u64> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().map(|(id, _tx)| id).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing outstanding requests on close");
        }
    }
}

/// Removes the pending entry when a call future is dropped before its
/// response arrives (timeout, cancellation, caller abandon).
struct PendingGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&self.id);
    }
}

/// Per-connection request/response correlator.
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Bind a multiplexer to a connected transport's event stream and start
    /// the dispatch loop.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        on_notification: NotificationHandler,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let dispatch = tokio::spawn(run_dispatch(shared.clone(), events, on_notification));

        Arc::new(Self {
            transport,
            shared,
            next_id: AtomicU64::new(0),
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    /// Send a request and await its correlated response, bounded by
    /// `timeout`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().expect("pending map poisoned");
            pending.insert(id, tx);
        }
        // Cleans the entry up on every early exit below.
        let _guard = PendingGuard {
            shared: self.shared.clone(),
            id,
        };

        let request = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        if let Err(e) = self.transport.send(&request).await {
            return Err(RpcError::Send(e.to_string()));
        }

        let timeout_ms = timeout.as_millis() as u64;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(RpcError::Timeout { timeout_ms }),
            Ok(Err(_dropped)) => Err(RpcError::ConnectionClosed),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(RpcError::Rpc(error)),
        }
    }

    /// Send a notification; nothing is awaited.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.transport
            .send(&message)
            .await
            .map_err(|e| RpcError::Send(e.to_string()))
    }

    /// Run the mandatory `initialize` exchange.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, CoreError> {
        let params = serde_json::to_value(InitializeParams::client_default())
            .map_err(|e| CoreError::Internal(format!("serialize initialize params: {}", e)))?;
        let value = self
            .call("initialize", Some(params), timeout)
            .await
            .map_err(|e| CoreError::Connection(format!("handshake failed: {}", e)))?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::Connection(format!("handshake returned bad result: {}", e)))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().expect("pending map poisoned").len()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.dispatch.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.drain();
    }
}

async fn run_dispatch(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<TransportEvent>,
    on_notification: NotificationHandler,
) {
    loop {
        match events.recv().await {
            Some(TransportEvent::Message(JsonRpcMessage::Response(response))) => {
                let entry = {
                    let mut pending = shared.pending.lock().expect("pending map poisoned");
                    pending.remove(&response.id)
                };
                match entry {
                    Some(tx) => {
                        let outcome = match (response.result, response.error) {
                            (_, Some(error)) => Err(error),
                            (Some(value), None) => Ok(value),
                            (None, None) => Ok(serde_json::Value::Null),
                        };
                        // A dropped receiver means the caller timed out or
                        // was cancelled; the response is simply discarded.
                        let _ = tx.send(outcome);
                    }
                    None => {
                        debug!(id = response.id, "response for unknown request id, discarding");
                    }
                }
            }
            Some(TransportEvent::Message(JsonRpcMessage::Notification(notification))) => {
                on_notification(notification);
            }
            Some(TransportEvent::Message(JsonRpcMessage::Request(request))) => {
                debug!(
                    method = %request.method,
                    "server-initiated request is not supported, discarding"
                );
            }
            Some(TransportEvent::Closed { reason }) => {
                warn!(reason = %reason, "transport closed");
                break;
            }
            None => break,
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.drain();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Transport double: records writes, lets the test inject inbound events.
    struct FakeTransport {
        sent: Mutex<Vec<JsonRpcRequest>>,
        fail_sends: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            })
        }

        fn sent_ids(&self) -> Vec<u64> {
            self.sent.lock().unwrap().iter().map(|r| r.id).collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> CoreResult<mpsc::Receiver<TransportEvent>> {
            unreachable!("tests wire the event channel directly")
        }

        async fn disconnect(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn send(&self, message: &JsonRpcMessage) -> CoreResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(CoreError::Connection("broken pipe".to_string()));
            }
            if let JsonRpcMessage::Request(request) = message {
                self.sent.lock().unwrap().push(request.clone());
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    fn mux_with_channel(
        transport: Arc<FakeTransport>,
    ) -> (Arc<Multiplexer>, mpsc::Sender<TransportEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let mux = Multiplexer::new(transport, rx, Arc::new(|_| {}));
        (mux, tx)
    }

    fn response(id: u64, result: serde_json::Value) -> TransportEvent {
        TransportEvent::Message(JsonRpcMessage::Response(super::super::protocol::JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }))
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_from_one() {
        let transport = FakeTransport::new();
        let (mux, tx) = mux_with_channel(transport.clone());

        for i in 1..=3u64 {
            let call = mux.call("ping", None, Duration::from_secs(1));
            tokio::pin!(call);
            // Poll the call until the request hits the wire, then answer it.
            tokio::select! {
                biased;
                _ = &mut call => panic!("resolved without a response"),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            tx.send(response(i, json!(i))).await.unwrap();
            assert_eq!(call.await.unwrap(), json!(i));
        }

        assert_eq!(transport.sent_ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_out_of_order_correlation() {
        let transport = FakeTransport::new();
        let (mux, tx) = mux_with_channel(transport);

        let first = tokio::spawn({
            let mux = mux.clone();
            async move { mux.call("a", None, Duration::from_secs(2)).await }
        });
        let second = tokio::spawn({
            let mux = mux.clone();
            async move { mux.call("b", None, Duration::from_secs(2)).await }
        });

        // Wait until both requests are pending, then answer in reverse order.
        tokio::time::timeout(Duration::from_secs(1), async {
            while mux.pending_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(response(2, json!("for-2"))).await.unwrap();
        tx.send(response(1, json!("for-1"))).await.unwrap();

        let results = (first.await.unwrap(), second.await.unwrap());
        let mut values = vec![results.0.unwrap(), results.1.unwrap()];
        values.sort_by_key(|v| v.as_str().unwrap().to_string());
        assert_eq!(values, vec![json!("for-1"), json!("for-2")]);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_discards_late_response() {
        let transport = FakeTransport::new();
        let (mux, tx) = mux_with_channel(transport);

        let err = mux
            .call("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { timeout_ms: 50 }));
        assert_eq!(mux.pending_count(), 0);

        // The late response must be silently discarded.
        tx.send(response(1, json!("late"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mux.pending_count(), 0);
        assert!(!mux.is_closed());
    }

    #[tokio::test]
    async fn test_send_failure_cleans_pending_entry() {
        let transport = FakeTransport::new();
        transport.fail_sends.store(true, Ordering::SeqCst);
        let (mux, _tx) = mux_with_channel(transport);

        let err = mux
            .call("x", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Send(_)));
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_all_outstanding() {
        let transport = FakeTransport::new();
        let (mux, tx) = mux_with_channel(transport);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mux = mux.clone();
            handles.push(tokio::spawn(async move {
                mux.call("hang", None, Duration::from_secs(5)).await
            }));
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while mux.pending_count() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(TransportEvent::Closed {
            reason: "child exited".to_string(),
        })
        .await
        .unwrap();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::ConnectionClosed));
        }
        assert!(mux.is_closed());

        // Further calls fail fast.
        let err = mux
            .call("again", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_server_error_object_is_surfaced() {
        let transport = FakeTransport::new();
        let (mux, tx) = mux_with_channel(transport);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.call("bad", None, Duration::from_secs(2)).await }
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while mux.pending_count() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(TransportEvent::Message(JsonRpcMessage::Response(
            super::super::protocol::JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: 1,
                result: None,
                error: Some(ErrorObject::new(-32602, "invalid params")),
            },
        )))
        .await
        .unwrap();

        match call.await.unwrap().unwrap_err() {
            RpcError::Rpc(obj) => {
                assert_eq!(obj.code, -32602);
                assert_eq!(obj.message, "invalid params");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_and_notifications() {
        let transport = FakeTransport::new();
        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();
        let mux = Multiplexer::new(
            transport,
            rx,
            Arc::new(move |n| {
                assert_eq!(n.method, "notifications/message");
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Unknown id: logged and discarded, nothing breaks.
        tx.send(response(99, json!("orphan"))).await.unwrap();

        tx.send(TransportEvent::Message(JsonRpcMessage::Notification(
            JsonRpcNotification::new(
                "notifications/message",
                Some(json!({"level": "info", "data": "hello"})),
            ),
        )))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!mux.is_closed());
    }
}
