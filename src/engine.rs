//! Execution engine
//!
//! Drives one tool call end to end: resolve the server, lease a connection,
//! hand the request to the connection's multiplexer under a per-request
//! deadline, record the outcome, emit events. In-flight executions live in
//! an engine-owned map; the terminal transition writes the store first and
//! clears the in-flight view after, so status lookups stay deterministic.
//!
//! Timeouts fail the execution with `-32000` but leave the connection open;
//! a late response is discarded by the multiplexer. Explicit cancellation
//! races the in-flight request through a per-execution token and reports
//! the `-32800` sentinel on the failure event while the execution row keeps
//! neither result nor error. A sweeper marks executions stuck in `running`
//! past the configured threshold as failed with `-32002`.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{codes, CoreError, Result};
use crate::events::{DomainEvent, EventPublisher};
use crate::model::{Execution, ExecutionFilter, ExecutionStatus, Page, ServerStatus};
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use crate::rpc::mux::RpcError;
use crate::rpc::protocol::ErrorObject;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Per-request deadline; clamped into `[1 s, requestTimeoutMsMax]`.
    pub timeout_ms: Option<u64>,
    /// When true (the default) `execute` returns the pending view
    /// immediately and the call proceeds in the background.
    pub run_async: bool,
    /// Opaque caller identity recorded on the execution.
    pub executed_by: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            run_async: true,
            executed_by: None,
        }
    }
}

/// One tool invocation request.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub server_id: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub options: ExecuteOptions,
}

/// Execution list query: filter plus paging.
#[derive(Debug, Clone, Default)]
pub struct ExecutionListQuery {
    pub filter: ExecutionFilter,
    pub offset: usize,
    pub limit: Option<usize>,
}

struct Inflight {
    execution: Execution,
    cancel: CancellationToken,
}

enum Outcome {
    Complete(serde_json::Value),
    Fail(ErrorObject),
    Cancelled,
}

pub struct ExecutionEngine {
    config: Arc<CoreConfig>,
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn crate::store::ExecutionStore>,
    events: EventPublisher,
    inflight: Arc<RwLock<HashMap<Uuid, Inflight>>>,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<CoreConfig>,
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        store: Arc<dyn crate::store::ExecutionStore>,
        events: EventPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            pool,
            store,
            events,
            inflight: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the stuck-execution sweeper.
    pub fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => engine.sweep_stuck().await,
                    _ = engine.shutdown.cancelled() => break,
                }
            }
        });
        self.tasks.lock().expect("engine tasks poisoned").push(task);
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut slot = self.tasks.lock().expect("engine tasks poisoned");
            slot.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Start one execution. Every call produces a fresh execution id;
    /// retries are the caller's responsibility.
    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> Result<Execution> {
        let timeout_ms = self.config.clamp_request_timeout(request.options.timeout_ms);

        let execution = Execution::new(
            &request.server_id,
            &request.method,
            request.params.clone(),
            request.options.executed_by.clone(),
        );
        let id = execution.id;
        let cancel = CancellationToken::new();

        self.inflight.write().await.insert(
            id,
            Inflight {
                execution: execution.clone(),
                cancel: cancel.clone(),
            },
        );
        self.events.emit(DomainEvent::ExecutionStarted {
            execution_id: id,
            server_id: request.server_id.clone(),
            method: request.method.clone(),
        });

        if request.options.run_async {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run(id, request, timeout_ms, cancel).await;
            });
            Ok(execution)
        } else {
            self.clone().run(id, request, timeout_ms, cancel).await;
            self.get_execution(id).await
        }
    }

    async fn run(
        self: Arc<Self>,
        id: Uuid,
        request: ExecuteRequest,
        timeout_ms: u64,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            self.finalize(id, Outcome::Cancelled).await;
            return;
        }

        // The server must exist and be active.
        let server = match self.registry.try_get(&request.server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                self.finalize(
                    id,
                    Outcome::Fail(ErrorObject::new(
                        codes::SERVER_UNAVAILABLE,
                        format!("server {} not found", request.server_id),
                    )),
                )
                .await;
                return;
            }
            Err(e) => {
                self.finalize(
                    id,
                    Outcome::Fail(ErrorObject::new(codes::SERVER_UNAVAILABLE, e.to_string())),
                )
                .await;
                return;
            }
        };
        if server.status != ServerStatus::Active {
            self.finalize(
                id,
                Outcome::Fail(ErrorObject::new(
                    codes::SERVER_UNAVAILABLE,
                    format!("server {} is not active", request.server_id),
                )),
            )
            .await;
            return;
        }

        let lease = tokio::select! {
            biased;
            acquired = self.pool.acquire(&request.server_id) => match acquired {
                Ok(lease) => lease,
                Err(e) => {
                    self.finalize(
                        id,
                        Outcome::Fail(ErrorObject::new(
                            codes::CONNECTION_ERROR,
                            e.to_string(),
                        )),
                    )
                    .await;
                    return;
                }
            },
            _ = cancel.cancelled() => {
                self.finalize(id, Outcome::Cancelled).await;
                return;
            }
        };

        if let Err(e) = self.mark_running(id).await {
            debug!(execution_id = %id, error = %e, "execution gone before running");
            self.pool.release(&request.server_id).await;
            return;
        }

        // Dropping the call future on cancellation removes the pending
        // entry at the multiplexer, so a late response is discarded there.
        let outcome = tokio::select! {
            biased;
            result = lease.mux().call(
                &request.method,
                request.params.clone(),
                Duration::from_millis(timeout_ms),
            ) => match result {
                Ok(value) => Outcome::Complete(value),
                Err(RpcError::Rpc(error)) => Outcome::Fail(error),
                Err(RpcError::Timeout { timeout_ms }) => Outcome::Fail(ErrorObject {
                    code: codes::TIMEOUT,
                    message: "request timed out".to_string(),
                    data: Some(json!({ "timeoutMs": timeout_ms })),
                }),
                Err(e @ RpcError::ConnectionClosed) | Err(e @ RpcError::Send(_)) => {
                    Outcome::Fail(ErrorObject::new(codes::CONNECTION_ERROR, e.to_string()))
                }
            },
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        self.pool.release(&request.server_id).await;
        self.finalize(id, outcome).await;
    }

    async fn mark_running(&self, id: Uuid) -> Result<()> {
        let mut inflight = self.inflight.write().await;
        let entry = inflight
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("execution {}", id)))?;
        entry.execution.mark_running()
    }

    /// Apply the terminal transition: mutate the in-flight entry, write the
    /// store, then clear the in-flight view. A no-op when the execution is
    /// already terminal or was swept away.
    async fn finalize(&self, id: Uuid, outcome: Outcome) {
        let snapshot = {
            let mut inflight = self.inflight.write().await;
            let Some(entry) = inflight.get_mut(&id) else {
                return;
            };
            if entry.execution.status.is_terminal() {
                return;
            }
            let transition = match outcome {
                Outcome::Complete(value) => entry.execution.complete(value),
                Outcome::Fail(error) => entry.execution.fail(error),
                Outcome::Cancelled => entry.execution.cancel(),
            };
            if let Err(e) = transition {
                error!(execution_id = %id, error = %e, "terminal transition rejected");
                return;
            }
            entry.execution.clone()
        };

        let event = match snapshot.status {
            ExecutionStatus::Completed => DomainEvent::ExecutionCompleted {
                execution_id: id,
                server_id: snapshot.server_id.clone(),
                duration_ms: snapshot.duration_ms.unwrap_or(0),
            },
            ExecutionStatus::Cancelled => DomainEvent::ExecutionFailed {
                execution_id: id,
                server_id: snapshot.server_id.clone(),
                error: ErrorObject::new(codes::CANCELLED, "execution cancelled"),
            },
            _ => DomainEvent::ExecutionFailed {
                execution_id: id,
                server_id: snapshot.server_id.clone(),
                error: snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorObject::new(codes::CONNECTION_ERROR, "unknown failure")),
            },
        };

        match self.store.put_execution(snapshot).await {
            Ok(()) => {
                self.inflight.write().await.remove(&id);
            }
            Err(e) => {
                // Keep the terminal in-flight view so lookups still resolve;
                // the row is lost on restart but never inconsistent.
                error!(execution_id = %id, error = %e, "failed to persist terminal execution");
            }
        }

        self.events.emit(event);
    }

    /// Cancel a non-terminal execution. Idempotent; a no-op on terminal
    /// executions.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<()> {
        {
            let inflight = self.inflight.read().await;
            if let Some(entry) = inflight.get(&id) {
                if !entry.execution.status.is_terminal() {
                    entry.cancel.cancel();
                }
                return Ok(());
            }
        }
        // Already persisted means already terminal.
        if self.store.get_execution(id).await?.is_some() {
            return Ok(());
        }
        Err(CoreError::NotFound(format!("execution {}", id)))
    }

    /// The in-flight view if present, else the persisted row.
    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        if let Some(entry) = self.inflight.read().await.get(&id) {
            return Ok(entry.execution.clone());
        }
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("execution {}", id)))
    }

    pub async fn list_executions(&self, query: &ExecutionListQuery) -> Result<Page<Execution>> {
        let mut by_id: HashMap<Uuid, Execution> = self
            .store
            .list_executions(&query.filter)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        for entry in self.inflight.read().await.values() {
            if query.filter.matches(&entry.execution) {
                by_id.insert(entry.execution.id, entry.execution.clone());
            }
        }

        let mut all: Vec<Execution> = by_id.into_values().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = all.len();
        let items: Vec<Execution> = all
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(Page {
            limit: query.limit.unwrap_or(total),
            offset: query.offset,
            total,
            items,
        })
    }

    /// Executions for one server, for the delete cascade.
    pub async fn prune_for_server(&self, server_id: &str, cutoff: chrono::DateTime<Utc>) -> Result<usize> {
        self.store.prune_executions(server_id, cutoff).await
    }

    /// Fail executions stuck in `running` past the configured threshold.
    /// Safety net for tasks that died between the running transition and
    /// their terminal one.
    pub async fn sweep_stuck(&self) {
        let threshold = chrono::Duration::milliseconds(self.config.execution_stuck_ms as i64);
        let now = Utc::now();

        let stuck: Vec<(Uuid, CancellationToken)> = {
            let inflight = self.inflight.read().await;
            inflight
                .iter()
                .filter(|(_, entry)| {
                    entry.execution.status == ExecutionStatus::Running
                        && now - entry.execution.started_at > threshold
                })
                .map(|(id, entry)| (*id, entry.cancel.clone()))
                .collect()
        };

        for (id, cancel) in stuck {
            warn!(execution_id = %id, "marking stuck execution as failed");
            self.finalize(
                id,
                Outcome::Fail(ErrorObject::new(
                    codes::STUCK_TIMEOUT,
                    "execution stuck in running state",
                )),
            )
            .await;
            // Wake the runner, if it still exists, so it releases its lease.
            cancel.cancel();
        }
    }

    /// Number of executions currently in flight.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.read().await.len()
    }
}
