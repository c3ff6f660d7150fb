// Domain event emission
//
// Every event carries a UUID, a wall-clock timestamp, a type discriminator,
// and a typed payload with enough context (server id, execution id) for
// consumers to re-order if they need to. Delivery is best-effort: events go
// through a bounded in-process queue (drop-oldest on overflow) drained by
// one background task into the injected sink, so emission never blocks or
// fails a caller operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::rpc::protocol::ErrorObject;

/// Typed payload of a domain event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    ServerRegistered { server_id: String, name: String },
    #[serde(rename_all = "camelCase")]
    ServerUpdated { server_id: String },
    #[serde(rename_all = "camelCase")]
    ServerDeleted { server_id: String },
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: Uuid,
        server_id: String,
        method: String,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionCompleted {
        execution_id: Uuid,
        server_id: String,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionFailed {
        execution_id: Uuid,
        server_id: String,
        error: ErrorObject,
    },
    #[serde(rename_all = "camelCase")]
    ToolsDiscovered {
        server_id: String,
        discovered: usize,
        removed: usize,
    },
}

/// Envelope published to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: DomainEvent,
}

impl Event {
    pub fn new(payload: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Abstract event bus consumed by the core.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Sink that retains events in memory, for tests and stand-alone embedding.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().expect("sink poisoned").push(event);
        Ok(())
    }
}

struct QueueState {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

/// Handle for emitting domain events. Cheap to clone; all clones feed the
/// same queue and worker.
#[derive(Clone)]
pub struct EventPublisher {
    state: Arc<QueueState>,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        let state = Arc::new(QueueState {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let worker_state = state.clone();
        let worker_shutdown = shutdown.clone();
        let worker = tokio::spawn(async move {
            loop {
                drain(&worker_state, sink.as_ref()).await;
                tokio::select! {
                    _ = worker_state.notify.notified() => {}
                    _ = worker_shutdown.cancelled() => {
                        drain(&worker_state, sink.as_ref()).await;
                        break;
                    }
                }
            }
        });

        Self {
            state,
            shutdown,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Queue one event. Never blocks; the oldest queued event is dropped
    /// when the buffer is full.
    pub fn emit(&self, payload: DomainEvent) {
        let event = Event::new(payload);
        {
            let mut queue = self.state.queue.lock().expect("event queue poisoned");
            if queue.len() >= self.state.capacity {
                queue.pop_front();
                let dropped = self.state.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event buffer full, dropping oldest event");
            }
            queue.push_back(event);
        }
        self.state.notify.notify_one();
    }

    /// Total events dropped to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Flush the queue and stop the worker.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn drain(state: &QueueState, sink: &dyn EventSink) {
    loop {
        let event = {
            let mut queue = state.queue.lock().expect("event queue poisoned");
            queue.pop_front()
        };
        let Some(event) = event else { break };
        if let Err(e) = sink.publish(event).await {
            // Emission is off the critical path; failures are logged, never
            // propagated.
            error!(error = %e, "event sink publish failed");
        }
    }
}
