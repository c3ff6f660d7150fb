//! Health and discovery loops
//!
//! Runs alongside everything else. Per `active` server: a periodic liveness
//! probe that refreshes `last_health_check`, and a periodic (or on-demand)
//! `tools/list` that is diffed into the tool catalog. Both go through the
//! normal pool path, so probing a disconnected server opens its connection.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::{CatalogDiff, ToolCatalog};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{DomainEvent, EventPublisher};
use crate::pool::{ping, ConnectionPool};
use crate::registry::ServerRegistry;
use crate::rpc::protocol::ToolsListResult;

/// Outcome of an on-demand discovery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub servers_scanned: usize,
    pub tools_discovered: usize,
    pub errors: Vec<DiscoveryError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryError {
    pub server_id: String,
    pub error: String,
}

pub struct DiscoveryService {
    config: Arc<CoreConfig>,
    registry: Arc<ServerRegistry>,
    catalog: Arc<ToolCatalog>,
    pool: Arc<ConnectionPool>,
    events: EventPublisher,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(
        config: Arc<CoreConfig>,
        registry: Arc<ServerRegistry>,
        catalog: Arc<ToolCatalog>,
        pool: Arc<ConnectionPool>,
        events: EventPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            catalog,
            pool,
            events,
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the periodic health and discovery loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("discovery tasks poisoned");

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(service.config.health_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => service.health_pass().await,
                    _ = service.shutdown.cancelled() => break,
                }
            }
        }));

        let service = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(service.config.discovery_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => { let _ = service.discover(None).await; }
                    _ = service.shutdown.cancelled() => break,
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut slot = self.tasks.lock().expect("discovery tasks poisoned");
            slot.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Probe every active server once.
    pub async fn health_pass(&self) {
        let servers = match self.registry.list_active().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "health pass could not list servers");
                return;
            }
        };

        for server in servers {
            match self.pool.acquire(&server.id).await {
                Ok(lease) => {
                    match ping(lease.mux()).await {
                        Ok(()) => {
                            let _ = self.registry.touch_health_check(&server.id).await;
                        }
                        Err(e) => {
                            debug!(server_id = %server.id, error = %e, "health probe failed");
                        }
                    }
                    self.pool.release(&server.id).await;
                }
                Err(e) => {
                    debug!(server_id = %server.id, error = %e, "health probe could not connect");
                }
            }
        }
    }

    /// Refresh one server's catalog, or every active server's when no id is
    /// given.
    pub async fn discover(&self, server_id: Option<&str>) -> Result<DiscoveryReport> {
        let targets = match server_id {
            Some(id) => vec![self.registry.get(id).await?],
            None => self.registry.list_active().await?,
        };

        let mut report = DiscoveryReport::default();
        for server in targets {
            report.servers_scanned += 1;
            match self.discover_server(&server.id).await {
                Ok(diff) => report.tools_discovered += diff.discovered,
                Err(e) => report.errors.push(DiscoveryError {
                    server_id: server.id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// One `tools/list` round trip, diffed into the catalog.
    pub async fn discover_server(&self, server_id: &str) -> Result<CatalogDiff> {
        let lease = self.pool.acquire(server_id).await?;
        let timeout = Duration::from_millis(self.config.request_timeout_ms_default);
        let listed = lease
            .mux()
            .call("tools/list", Some(json!({})), timeout)
            .await;
        self.pool.release(server_id).await;

        let value = listed.map_err(|e| e.into_core())?;
        let result: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| CoreError::Internal(format!("malformed tools/list result: {}", e)))?;

        let diff = self.catalog.apply_discovery(server_id, result.tools).await?;
        self.events.emit(DomainEvent::ToolsDiscovered {
            server_id: server_id.to_string(),
            discovered: diff.discovered,
            removed: diff.removed,
        });
        Ok(diff)
    }
}
