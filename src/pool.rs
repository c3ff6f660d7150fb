//! Connection pool
//!
//! At most one live connection per server at any time; at most
//! `max_connections` live connections overall. Concurrent acquires for one
//! server serialise on that server's slot lock, so exactly one open is ever
//! in flight. A connection holds a lease count instead of a boolean busy
//! flag: concurrent executions share the single per-server connection, and
//! a connection is "in use" iff its lease count is above zero. When a fresh
//! open would exceed capacity, the least-recently-used connection with zero
//! leases is evicted; if every connection is leased the acquire fails with
//! `PoolExhausted`.
//!
//! The pool owns the connection lifecycle end to end: it opens the
//! transport, runs the `initialize` handshake through the multiplexer, and
//! projects every state transition onto the server row via the registry.
//! Two background loops keep the pool healthy: a periodic ping per live
//! connection (three consecutive failures remove it) and an idle sweep that
//! drops non-leased connections untouched past the idle TTL.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{codes, CoreError, Result};
use crate::model::{
    AdvertisedCapabilities, ConnectionStatus, Server, ServerRuntimeInfo, TransportConfig,
};
use crate::registry::ServerRegistry;
use crate::rpc::mux::{Multiplexer, NotificationHandler, RpcError};
use crate::rpc::protocol::LogMessageParams;
use crate::transport::{build_transport, Transport};

const TERMINATE_GRACE: Duration = Duration::from_millis(100);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const MAX_CONSECUTIVE_PING_FAILURES: u32 = 3;

/// Builds transports for the pool; injectable so tests can script the wire.
pub trait TransportFactory: Send + Sync {
    fn build(&self, config: &TransportConfig, core: &CoreConfig) -> Arc<dyn Transport>;
}

/// Production factory dispatching on the transport discriminator.
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &TransportConfig, core: &CoreConfig) -> Arc<dyn Transport> {
        build_transport(config, core)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connected,
    Error,
    Closing,
}

struct PooledConnection {
    transport: Arc<dyn Transport>,
    mux: Arc<Multiplexer>,
    handshake: ServerRuntimeInfo,
    state: ConnectionState,
    last_used: Instant,
    error_count: u32,
    leases: usize,
}

struct ServerSlot {
    server_id: String,
    state: tokio::sync::Mutex<Option<PooledConnection>>,
}

/// One reserved unit of pool capacity, given back on drop unless committed
/// into a stored connection.
struct CapacityReservation<'a> {
    live: &'a AtomicUsize,
    committed: bool,
}

impl CapacityReservation<'_> {
    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for CapacityReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A leased connection. Callers hand it back with [`ConnectionPool::release`].
pub struct ConnectionLease {
    pub server_id: String,
    mux: Arc<Multiplexer>,
    handshake: ServerRuntimeInfo,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("server_id", &self.server_id)
            .field("handshake", &self.handshake)
            .finish()
    }
}

impl ConnectionLease {
    pub fn mux(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn handshake(&self) -> &ServerRuntimeInfo {
        &self.handshake
    }
}

pub struct ConnectionPool {
    config: Arc<CoreConfig>,
    registry: Arc<ServerRegistry>,
    factory: Arc<dyn TransportFactory>,
    slots: StdMutex<HashMap<String, Arc<ServerSlot>>>,
    live_count: AtomicUsize,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        config: Arc<CoreConfig>,
        registry: Arc<ServerRegistry>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            factory,
            slots: StdMutex::new(HashMap::new()),
            live_count: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the health-check and idle-evict loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("pool tasks poisoned");

        let pool = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(pool.config.health_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => pool.health_check_all().await,
                    _ = pool.shutdown.cancelled() => break,
                }
            }
        }));

        let pool = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => pool.evict_idle().await,
                    _ = pool.shutdown.cancelled() => break,
                }
            }
        }));
    }

    /// Stop the loops and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut slot = self.tasks.lock().expect("pool tasks poisoned");
            slot.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        let slots = self.snapshot();
        for slot in slots {
            let mut state = slot.state.lock().await;
            if let Some(conn) = state.take() {
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                let _ = conn.mux.notify("notifications/terminated", Some(json!({}))).await;
                let _ = conn.transport.disconnect().await;
            }
        }
    }

    /// Lease the server's connection, opening one if needed.
    pub async fn acquire(&self, server_id: &str) -> Result<ConnectionLease> {
        let server = self
            .registry
            .try_get(server_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("server {}", server_id)))?;

        let slot = self.slot_for(server_id);
        let mut state = slot.state.lock().await;

        if let Some(conn) = state.as_mut() {
            if conn.mux.is_closed() || !conn.transport.is_connected() {
                let dead = state.take().expect("checked above");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                debug!(
                    server_id = %server_id,
                    state = ?dead.state,
                    "dropping dead connection before reopen"
                );
                let reason = dead.transport.last_error();
                let _ = dead.transport.disconnect().await;
                let _ = self
                    .registry
                    .set_connection_status(server_id, ConnectionStatus::Disconnected, reason)
                    .await;
            } else {
                conn.leases += 1;
                conn.last_used = Instant::now();
                return Ok(ConnectionLease {
                    server_id: server_id.to_string(),
                    mux: conn.mux.clone(),
                    handshake: conn.handshake.clone(),
                });
            }
        }

        // Reserves one unit of capacity in live_count before the open, so
        // concurrent opens for different servers cannot overshoot the bound.
        // The reservation rolls itself back if the open fails or this
        // future is dropped mid-way.
        let mut reservation = self.reserve_capacity(server_id).await?;

        let _ = self
            .registry
            .set_connection_status(server_id, ConnectionStatus::Connecting, None)
            .await;

        match self.open_with_retries(&server).await {
            Ok(conn) => {
                reservation.commit();
                let _ = self
                    .registry
                    .record_handshake(server_id, conn.handshake.clone())
                    .await;
                let lease = ConnectionLease {
                    server_id: server_id.to_string(),
                    mux: conn.mux.clone(),
                    handshake: conn.handshake.clone(),
                };
                *state = Some(conn);
                Ok(lease)
            }
            Err(e) => {
                let _ = self
                    .registry
                    .set_connection_status(
                        server_id,
                        ConnectionStatus::Error,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Return a lease. Dead connections are removed on the way back.
    pub async fn release(&self, server_id: &str) {
        let slot = {
            let slots = self.slots.lock().expect("pool slots poisoned");
            slots.get(server_id).cloned()
        };
        let Some(slot) = slot else { return };

        let mut state = slot.state.lock().await;
        if let Some(conn) = state.as_mut() {
            conn.leases = conn.leases.saturating_sub(1);
            conn.last_used = Instant::now();
            if conn.mux.is_closed() || !conn.transport.is_connected() {
                let dead = state.take().expect("checked above");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                let reason = dead.transport.last_error();
                let _ = dead.transport.disconnect().await;
                let _ = self
                    .registry
                    .set_connection_status(server_id, ConnectionStatus::Disconnected, reason)
                    .await;
            }
        }
    }

    /// Disconnect and discard the server's connection. Outstanding requests
    /// terminate through the multiplexer's connection-closed path.
    pub async fn remove(&self, server_id: &str) -> Result<()> {
        let slot = {
            let mut slots = self.slots.lock().expect("pool slots poisoned");
            slots.remove(server_id)
        };
        let Some(slot) = slot else { return Ok(()) };

        let mut state = slot.state.lock().await;
        if let Some(mut conn) = state.take() {
            conn.state = ConnectionState::Closing;
            self.live_count.fetch_sub(1, Ordering::SeqCst);
            // Fire-and-forget goodbye, then a short grace before forced close.
            let _ = conn
                .mux
                .notify("notifications/terminated", Some(json!({})))
                .await;
            tokio::time::sleep(TERMINATE_GRACE).await;
            let _ = conn.transport.disconnect().await;
            let _ = self
                .registry
                .set_connection_status(server_id, ConnectionStatus::Disconnected, None)
                .await;
        }
        Ok(())
    }

    /// Number of live connections.
    pub fn live_connections(&self) -> usize {
        self.live_count.load(Ordering::SeqCst)
    }

    /// One health pass over every live connection.
    pub async fn health_check_all(&self) {
        for slot in self.snapshot() {
            let Ok(mut state) = slot.state.try_lock() else {
                continue; // an open or remove is in flight
            };
            let Some(conn) = state.as_mut() else { continue };

            if conn.mux.is_closed() || !conn.transport.is_connected() {
                let dead = state.take().expect("checked above");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                let reason = dead.transport.last_error();
                let _ = dead.transport.disconnect().await;
                let _ = self
                    .registry
                    .set_connection_status(&slot.server_id, ConnectionStatus::Disconnected, reason)
                    .await;
                continue;
            }

            match ping(&conn.mux).await {
                Ok(()) => {
                    conn.error_count = 0;
                    conn.state = ConnectionState::Connected;
                    let _ = self.registry.touch_health_check(&slot.server_id).await;
                }
                Err(e) => {
                    conn.error_count += 1;
                    conn.state = ConnectionState::Error;
                    warn!(
                        server_id = %slot.server_id,
                        error = %e,
                        failures = conn.error_count,
                        "health check failed"
                    );
                    let _ = self
                        .registry
                        .set_connection_status(
                            &slot.server_id,
                            ConnectionStatus::Error,
                            Some(e.to_string()),
                        )
                        .await;
                    if conn.error_count >= MAX_CONSECUTIVE_PING_FAILURES {
                        let dead = state.take().expect("checked above");
                        self.live_count.fetch_sub(1, Ordering::SeqCst);
                        let _ = dead.transport.disconnect().await;
                        let _ = self
                            .registry
                            .set_connection_status(
                                &slot.server_id,
                                ConnectionStatus::Disconnected,
                                Some("removed after repeated health-check failures".to_string()),
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Drop non-leased connections idle past the configured TTL.
    pub async fn evict_idle(&self) {
        let idle_ttl = Duration::from_millis(self.config.idle_evict_ms);
        for slot in self.snapshot() {
            let Ok(mut state) = slot.state.try_lock() else { continue };
            let evict = matches!(
                state.as_ref(),
                Some(conn) if conn.leases == 0 && conn.last_used.elapsed() >= idle_ttl
            );
            if evict {
                let conn = state.take().expect("checked above");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                info!(server_id = %slot.server_id, "evicting idle connection");
                let _ = conn.transport.disconnect().await;
                let _ = self
                    .registry
                    .set_connection_status(&slot.server_id, ConnectionStatus::Disconnected, None)
                    .await;
            }
        }
    }

    fn slot_for(&self, server_id: &str) -> Arc<ServerSlot> {
        let mut slots = self.slots.lock().expect("pool slots poisoned");
        slots
            .entry(server_id.to_string())
            .or_insert_with(|| {
                Arc::new(ServerSlot {
                    server_id: server_id.to_string(),
                    state: tokio::sync::Mutex::new(None),
                })
            })
            .clone()
    }

    fn snapshot(&self) -> Vec<Arc<ServerSlot>> {
        let slots = self.slots.lock().expect("pool slots poisoned");
        slots.values().cloned().collect()
    }

    /// Reserve one unit of capacity in `live_count`, evicting the LRU
    /// non-leased connection if the pool is full. The reservation releases
    /// its unit on drop unless committed.
    async fn reserve_capacity(&self, opening_for: &str) -> Result<CapacityReservation<'_>> {
        loop {
            let current = self.live_count.load(Ordering::SeqCst);
            if current < self.config.max_connections {
                if self
                    .live_count
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return Ok(CapacityReservation {
                        live: &self.live_count,
                        committed: false,
                    });
                }
                continue;
            }

            let mut candidate: Option<Arc<ServerSlot>> = None;
            let mut oldest = Instant::now();
            for slot in self.snapshot() {
                if slot.server_id == opening_for {
                    continue;
                }
                let Ok(state) = slot.state.try_lock() else { continue };
                if let Some(conn) = state.as_ref() {
                    if conn.leases == 0 && conn.last_used <= oldest {
                        oldest = conn.last_used;
                        candidate = Some(slot.clone());
                    }
                }
            }

            let Some(slot) = candidate else {
                return Err(CoreError::PoolExhausted(format!(
                    "{} connections live, all leased",
                    self.config.max_connections
                )));
            };

            let Ok(mut state) = slot.state.try_lock() else { continue };
            // Re-check under the lock; a lease may have landed meanwhile.
            let evict = matches!(state.as_ref(), Some(conn) if conn.leases == 0);
            if evict {
                let conn = state.take().expect("checked above");
                self.live_count.fetch_sub(1, Ordering::SeqCst);
                debug!(server_id = %slot.server_id, "evicting LRU connection for capacity");
                let _ = conn.transport.disconnect().await;
                let _ = self
                    .registry
                    .set_connection_status(&slot.server_id, ConnectionStatus::Disconnected, None)
                    .await;
            }
        }
    }

    async fn open_with_retries(&self, server: &Server) -> Result<PooledConnection> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
            match self.open(server).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(
                        server_id = %server.id,
                        attempt = attempt + 1,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| CoreError::Internal("connect loop made no attempt".to_string())))
    }

    async fn open(&self, server: &Server) -> Result<PooledConnection> {
        let transport = self.factory.build(&server.transport, &self.config);

        let events = match tokio::time::timeout(
            self.config.connection_timeout(),
            transport.connect(),
        )
        .await
        {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = transport.disconnect().await;
                return Err(CoreError::Connection(format!(
                    "connect timed out after {} ms",
                    self.config.connection_timeout_ms
                )));
            }
        };

        let mux = Multiplexer::new(
            transport.clone(),
            events,
            notification_handler(server.id.clone()),
        );

        let init = match mux.initialize(self.config.connection_timeout()).await {
            Ok(init) => init,
            Err(e) => {
                // Leave nothing half-open behind a failed handshake.
                let _ = transport.disconnect().await;
                return Err(e);
            }
        };

        let handshake = ServerRuntimeInfo {
            protocol_version: init.protocol_version,
            capabilities: AdvertisedCapabilities {
                tools: init.capabilities.supports_tools(),
                resources: init.capabilities.supports_resources(),
                prompts: init.capabilities.supports_prompts(),
                logging: init.capabilities.supports_logging(),
            },
            vendor_name: init.server_info.name,
            vendor_version: init.server_info.version,
        };

        Ok(PooledConnection {
            transport,
            mux,
            handshake,
            state: ConnectionState::Connected,
            last_used: Instant::now(),
            error_count: 0,
            leases: 0,
        })
    }
}

/// Liveness probe: `ping`, falling back to a `tools/list` head for servers
/// that do not implement it.
pub(crate) async fn ping(mux: &Arc<Multiplexer>) -> std::result::Result<(), RpcError> {
    match mux.call("ping", Some(json!({})), PING_TIMEOUT).await {
        Ok(_) => Ok(()),
        Err(RpcError::Rpc(ref obj)) if obj.code == codes::METHOD_NOT_FOUND => mux
            .call("tools/list", Some(json!({})), PING_TIMEOUT)
            .await
            .map(|_| ()),
        Err(e) => Err(e),
    }
}

fn notification_handler(server_id: String) -> NotificationHandler {
    Arc::new(move |notification| {
        if notification.method == "notifications/message" {
            let params = notification
                .params
                .and_then(|p| serde_json::from_value::<LogMessageParams>(p).ok());
            match params {
                Some(params) => match params.level.as_str() {
                    "error" => warn!(server_id = %server_id, data = %params.data, "server log"),
                    "warning" => warn!(server_id = %server_id, data = %params.data, "server log"),
                    _ => info!(server_id = %server_id, data = %params.data, "server log"),
                },
                None => debug!(server_id = %server_id, "malformed notifications/message params"),
            }
        } else {
            debug!(
                server_id = %server_id,
                method = %notification.method,
                "ignoring server notification"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use crate::events::EventPublisher;
    use crate::events::MemorySink;
    use crate::model::{ServerPatch, ServerSpec, ServerStatus, StdioConfig};
    use crate::rpc::protocol::{JsonRpcMessage, JsonRpcResponse};
    use crate::store::{MemoryCache, MemoryStore};
    use crate::transport::TransportEvent;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    /// Auto-responding transport double: answers initialize/ping/tools/list,
    /// stays silent on "never", and can be force-closed.
    struct ScriptedTransport {
        connected: AtomicBool,
        events_tx: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
        fail_connect: bool,
        refuse_ping: AtomicBool,
    }

    impl ScriptedTransport {
        fn new(fail_connect: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(false),
                events_tx: StdMutex::new(None),
                fail_connect,
                refuse_ping: AtomicBool::new(false),
            })
        }

        async fn force_close(&self) {
            self.connected.store(false, Ordering::SeqCst);
            let tx = self.events_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx
                    .send(TransportEvent::Closed {
                        reason: "scripted close".to_string(),
                    })
                    .await;
            }
        }

        async fn respond(&self, id: u64, result: serde_json::Value) {
            let tx = self.events_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx
                    .send(TransportEvent::Message(JsonRpcMessage::Response(
                        JsonRpcResponse {
                            jsonrpc: "2.0".to_string(),
                            id,
                            result: Some(result),
                            error: None,
                        },
                    )))
                    .await;
            }
        }

        async fn respond_error(&self, id: u64, code: i64, message: &str) {
            let tx = self.events_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx
                    .send(TransportEvent::Message(JsonRpcMessage::Response(
                        JsonRpcResponse {
                            jsonrpc: "2.0".to_string(),
                            id,
                            result: None,
                            error: Some(crate::rpc::protocol::ErrorObject::new(code, message)),
                        },
                    )))
                    .await;
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> CoreResult<mpsc::Receiver<TransportEvent>> {
            if self.fail_connect {
                return Err(CoreError::Connection("scripted connect failure".to_string()));
            }
            let (tx, rx) = mpsc::channel(32);
            *self.events_tx.lock().unwrap() = Some(tx);
            self.connected.store(true, Ordering::SeqCst);
            Ok(rx)
        }

        async fn disconnect(&self) -> CoreResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.events_tx.lock().unwrap().take();
            Ok(())
        }

        async fn send(&self, message: &JsonRpcMessage) -> CoreResult<()> {
            let JsonRpcMessage::Request(request) = message else {
                return Ok(());
            };
            match request.method.as_str() {
                "initialize" => {
                    self.respond(
                        request.id,
                        json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "scripted", "version": "1.0" }
                        }),
                    )
                    .await;
                }
                "ping" => {
                    if self.refuse_ping.load(Ordering::SeqCst) {
                        self.respond_error(request.id, -32603, "scripted ping failure")
                            .await;
                    } else {
                        self.respond(request.id, json!({})).await;
                    }
                }
                "tools/list" => {
                    self.respond(request.id, json!({ "tools": [] })).await;
                }
                "never" => {}
                other => {
                    self.respond(request.id, json!({ "echo": other })).await;
                }
            }
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    /// Factory that records every transport it built, keyed by command.
    struct ScriptedFactory {
        built: StdMutex<Vec<(String, Arc<ScriptedTransport>)>>,
        fail_connect: AtomicBool,
    }

    impl ScriptedFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                built: StdMutex::new(Vec::new()),
                fail_connect: AtomicBool::new(false),
            })
        }

        fn connects_for(&self, tag: &str) -> usize {
            self.built
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == tag)
                .count()
        }

        fn last_for(&self, tag: &str) -> Arc<ScriptedTransport> {
            self.built
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(t, _)| t == tag)
                .map(|(_, transport)| transport.clone())
                .expect("no transport built for tag")
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn build(&self, config: &TransportConfig, _core: &CoreConfig) -> Arc<dyn Transport> {
            let tag = match config {
                TransportConfig::Stdio(cfg) => cfg.command.clone(),
                other => format!("{:?}", other.kind()),
            };
            let transport = ScriptedTransport::new(self.fail_connect.load(Ordering::SeqCst));
            self.built.lock().unwrap().push((tag, transport.clone()));
            transport
        }
    }

    struct Fixture {
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        factory: Arc<ScriptedFactory>,
    }

    async fn fixture(config: CoreConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = EventPublisher::new(Arc::new(MemorySink::new()), 64);
        let registry = Arc::new(ServerRegistry::new(
            store,
            Arc::new(MemoryCache::new()),
            events,
        ));
        let factory = ScriptedFactory::new();
        let pool = ConnectionPool::new(Arc::new(config), registry.clone(), factory.clone());
        Fixture {
            registry,
            pool,
            factory,
        }
    }

    async fn register(fixture: &Fixture, tag: &str) -> String {
        let server = fixture
            .registry
            .create(ServerSpec {
                name: tag.to_string(),
                description: None,
                transport: TransportConfig::Stdio(StdioConfig {
                    command: tag.to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    working_dir: None,
                }),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        fixture
            .registry
            .update(
                &server.id,
                ServerPatch {
                    status: Some(ServerStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        server.id
    }

    fn fast_config() -> CoreConfig {
        CoreConfig {
            max_retries: 0,
            retry_delay_ms: 10,
            connection_timeout_ms: 2_000,
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_unknown_server_is_not_found() {
        let fixture = fixture(fast_config()).await;
        let err = fixture.pool.acquire("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_acquire_opens_once_and_reuses() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        let lease = fixture.pool.acquire(&id).await.unwrap();
        assert_eq!(lease.handshake().vendor_name, "scripted");
        fixture.pool.release(&id).await;

        let _lease = fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;

        assert_eq!(fixture.factory.connects_for("alpha"), 1);
        assert_eq!(fixture.pool.live_connections(), 1);

        // Handshake info landed on the server row.
        let server = fixture.registry.get(&id).await.unwrap();
        let info = server.server_info.unwrap();
        assert_eq!(info.vendor_name, "scripted");
        assert!(info.capabilities.tools);
        assert_eq!(server.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_deduplicate_open() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = fixture.pool.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { pool.acquire(&id).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fixture.factory.connects_for("alpha"), 1);
        assert_eq!(fixture.pool.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_and_marks_error() {
        let fixture = fixture(fast_config()).await;
        fixture.factory.fail_connect.store(true, Ordering::SeqCst);
        let id = register(&fixture, "alpha").await;

        let err = fixture.pool.acquire(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::Connection(_)));

        let server = fixture.registry.get(&id).await.unwrap();
        assert_eq!(server.connection_status, ConnectionStatus::Error);
        assert!(server.last_error.is_some());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let config = CoreConfig {
            max_connections: 2,
            ..fast_config()
        };
        let fixture = fixture(config).await;
        let a = register(&fixture, "a").await;
        let b = register(&fixture, "b").await;
        let c = register(&fixture, "c").await;

        fixture.pool.acquire(&a).await.unwrap();
        fixture.pool.release(&a).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        fixture.pool.acquire(&b).await.unwrap();
        fixture.pool.release(&b).await;

        // Opening c evicts a, the LRU of the two idle connections.
        fixture.pool.acquire(&c).await.unwrap();
        fixture.pool.release(&c).await;

        assert_eq!(fixture.pool.live_connections(), 2);
        assert!(!fixture.factory.last_for("a").is_connected());
        assert!(fixture.factory.last_for("b").is_connected());

        // A later acquire on the evicted server re-opens.
        fixture.pool.acquire(&a).await.unwrap();
        fixture.pool.release(&a).await;
        assert_eq!(fixture.factory.connects_for("a"), 2);
    }

    #[tokio::test]
    async fn test_pool_exhausted_when_all_leased() {
        let config = CoreConfig {
            max_connections: 1,
            ..fast_config()
        };
        let fixture = fixture(config).await;
        let a = register(&fixture, "a").await;
        let b = register(&fixture, "b").await;

        let _lease_a = fixture.pool.acquire(&a).await.unwrap();
        let err = fixture.pool.acquire(&b).await.unwrap_err();
        assert!(matches!(err, CoreError::PoolExhausted(_)));

        // Releasing frees the slot.
        fixture.pool.release(&a).await;
        fixture.pool.acquire(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_fails_outstanding_requests() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        let lease = fixture.pool.acquire(&id).await.unwrap();
        let mux = lease.mux().clone();
        let call = tokio::spawn(async move {
            mux.call("never", None, Duration::from_secs(10)).await
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while lease.mux().pending_count() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        fixture.pool.remove(&id).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
        assert_eq!(fixture.pool.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_dead_connection_reopens_on_next_acquire() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;

        fixture.factory.last_for("alpha").force_close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;
        assert_eq!(fixture.factory.connects_for("alpha"), 2);
    }

    #[tokio::test]
    async fn test_health_check_removes_after_three_failures() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;
        fixture
            .factory
            .last_for("alpha")
            .refuse_ping
            .store(true, Ordering::SeqCst);

        fixture.pool.health_check_all().await;
        fixture.pool.health_check_all().await;
        assert_eq!(fixture.pool.live_connections(), 1);

        fixture.pool.health_check_all().await;
        assert_eq!(fixture.pool.live_connections(), 0);

        let server = fixture.registry.get(&id).await.unwrap();
        assert_eq!(server.connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_healthy_ping_touches_health_check() {
        let fixture = fixture(fast_config()).await;
        let id = register(&fixture, "alpha").await;

        fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;
        fixture.pool.health_check_all().await;

        let server = fixture.registry.get(&id).await.unwrap();
        assert!(server.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let config = CoreConfig {
            idle_evict_ms: 10,
            ..fast_config()
        };
        let fixture = fixture(config).await;
        let id = register(&fixture, "alpha").await;

        fixture.pool.acquire(&id).await.unwrap();
        fixture.pool.release(&id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        fixture.pool.evict_idle().await;
        assert_eq!(fixture.pool.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_leased_connection_survives_idle_sweep() {
        let config = CoreConfig {
            idle_evict_ms: 10,
            ..fast_config()
        };
        let fixture = fixture(config).await;
        let id = register(&fixture, "alpha").await;

        let _lease = fixture.pool.acquire(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        fixture.pool.evict_idle().await;
        assert_eq!(fixture.pool.live_connections(), 1);
    }
}
