//! Integration core facade
//!
//! The surface the out-of-scope REST layer calls. Wires the registry, tool
//! catalog, connection pool, execution engine, and discovery service around
//! the injected Store / Cache / EventSink collaborators, and owns the
//! lifecycle of the background loops.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::catalog::ToolCatalog;
use crate::config::CoreConfig;
use crate::discovery::{DiscoveryReport, DiscoveryService};
use crate::engine::{ExecuteRequest, ExecutionEngine, ExecutionListQuery};
use crate::error::Result;
use crate::events::{EventPublisher, EventSink, MemorySink};
use crate::model::{
    AdvertisedCapabilities, Execution, Page, Server, ServerPatch, ServerSpec, Tool,
};
use crate::pool::{ping, ConnectionPool, DefaultTransportFactory, TransportFactory};
use crate::registry::{ServerListQuery, ServerRegistry};
use crate::store::{
    Cache, ExecutionStore, MemoryCache, MemoryStore, ServerStore, ToolStore,
};

/// Executions younger than this survive a server delete.
const EXECUTION_RETENTION_HOURS: i64 = 24;

/// Result of probing one server's connection.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestReport {
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<AdvertisedCapabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builder wiring the core with injected collaborators. Anything not
/// provided falls back to the in-memory defaults.
pub struct CoreBuilder {
    config: CoreConfig,
    server_store: Option<Arc<dyn ServerStore>>,
    tool_store: Option<Arc<dyn ToolStore>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    cache: Option<Arc<dyn Cache>>,
    sink: Option<Arc<dyn EventSink>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            server_store: None,
            tool_store: None,
            execution_store: None,
            cache: None,
            sink: None,
            transport_factory: None,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_store(mut self, store: Arc<dyn ServerStore>) -> Self {
        self.server_store = Some(store);
        self
    }

    pub fn tool_store(mut self, store: Arc<dyn ToolStore>) -> Self {
        self.tool_store = Some(store);
        self
    }

    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Arc<IntegrationCore>> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let default_store = Arc::new(MemoryStore::new());
        let server_store = self
            .server_store
            .unwrap_or_else(|| default_store.clone() as Arc<dyn ServerStore>);
        let tool_store = self
            .tool_store
            .unwrap_or_else(|| default_store.clone() as Arc<dyn ToolStore>);
        let execution_store = self
            .execution_store
            .unwrap_or_else(|| default_store.clone() as Arc<dyn ExecutionStore>);
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()) as Arc<dyn Cache>);
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(MemorySink::new()) as Arc<dyn EventSink>);
        let factory = self
            .transport_factory
            .unwrap_or_else(|| Arc::new(DefaultTransportFactory) as Arc<dyn TransportFactory>);

        let events = EventPublisher::new(sink, config.event_sink_buffer);
        let registry = Arc::new(ServerRegistry::new(
            server_store,
            cache.clone(),
            events.clone(),
        ));
        let catalog = Arc::new(ToolCatalog::new(tool_store, cache));
        let pool = ConnectionPool::new(config.clone(), registry.clone(), factory);
        let engine = ExecutionEngine::new(
            config.clone(),
            registry.clone(),
            pool.clone(),
            execution_store,
            events.clone(),
        );
        let discovery = DiscoveryService::new(
            config.clone(),
            registry.clone(),
            catalog.clone(),
            pool.clone(),
            events.clone(),
        );

        Ok(Arc::new(IntegrationCore {
            config,
            registry,
            catalog,
            pool,
            engine,
            discovery,
            events,
        }))
    }
}

pub struct IntegrationCore {
    config: Arc<CoreConfig>,
    registry: Arc<ServerRegistry>,
    catalog: Arc<ToolCatalog>,
    pool: Arc<ConnectionPool>,
    engine: Arc<ExecutionEngine>,
    discovery: Arc<DiscoveryService>,
    events: EventPublisher,
}

impl IntegrationCore {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    /// Spawn the background loops: connection health checks, idle eviction,
    /// the stuck-execution sweeper, and periodic health/discovery passes.
    pub fn start(self: &Arc<Self>) {
        self.pool.start();
        self.engine.start();
        self.discovery.start();
    }

    /// Stop the loops, flush events, close every connection.
    pub async fn shutdown(&self) {
        self.discovery.shutdown().await;
        self.engine.shutdown().await;
        self.pool.shutdown().await;
        self.events.shutdown().await;
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    // --- servers ---------------------------------------------------------

    pub async fn list_servers(&self, query: &ServerListQuery) -> Result<Page<Server>> {
        self.registry.list(query).await
    }

    pub async fn get_server(&self, id: &str) -> Result<Server> {
        self.registry.get(id).await
    }

    pub async fn create_server(&self, spec: ServerSpec) -> Result<Server> {
        self.registry.create(spec).await
    }

    pub async fn update_server(&self, id: &str, patch: ServerPatch) -> Result<Server> {
        self.registry.update(id, patch).await
    }

    /// Delete a server. Cascades: the live connection is discarded, tools
    /// are removed, and executions older than the retention window are
    /// pruned.
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        self.registry.delete(id).await?;
        self.pool.remove(id).await?;
        self.catalog.remove_server(id).await?;
        let cutoff = Utc::now() - chrono::Duration::hours(EXECUTION_RETENTION_HOURS);
        self.engine.prune_for_server(id, cutoff).await?;
        Ok(())
    }

    /// Probe a server's connection, opening one if needed.
    pub async fn test_connection(&self, id: &str) -> Result<ConnectionTestReport> {
        // Unknown ids are the caller's error, not a failed probe.
        self.registry.get(id).await?;

        let started = Instant::now();
        match self.pool.acquire(id).await {
            Ok(lease) => {
                let outcome = ping(lease.mux()).await;
                let capabilities = lease.handshake().capabilities;
                self.pool.release(id).await;
                match outcome {
                    Ok(()) => Ok(ConnectionTestReport {
                        success: true,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        capabilities: Some(capabilities),
                        error: None,
                    }),
                    Err(e) => Ok(ConnectionTestReport {
                        success: false,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        capabilities: Some(capabilities),
                        error: Some(e.to_string()),
                    }),
                }
            }
            Err(e) => Ok(ConnectionTestReport {
                success: false,
                response_time_ms: started.elapsed().as_millis() as u64,
                capabilities: None,
                error: Some(e.to_string()),
            }),
        }
    }

    // --- tools -----------------------------------------------------------

    /// Tools of one server. Empty for unknown or deleted servers, so a
    /// delete cascade is observable as an empty catalog.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<Tool>> {
        self.catalog.tools_for(server_id).await
    }

    pub async fn discover(&self, server_id: Option<&str>) -> Result<DiscoveryReport> {
        self.discovery.discover(server_id).await
    }

    // --- executions ------------------------------------------------------

    pub async fn execute(&self, request: ExecuteRequest) -> Result<Execution> {
        self.engine.execute(request).await
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.engine.get_execution(id).await
    }

    pub async fn cancel_execution(&self, id: Uuid) -> Result<()> {
        self.engine.cancel_execution(id).await
    }

    pub async fn list_executions(&self, query: &ExecutionListQuery) -> Result<Page<Execution>> {
        self.engine.list_executions(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let core = IntegrationCore::builder().build().unwrap();
        assert_eq!(core.config().max_connections, 50);

        let page = core
            .list_servers(&ServerListQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_by_builder() {
        let result = IntegrationCore::builder()
            .config(CoreConfig {
                max_connections: 0,
                ..CoreConfig::default()
            })
            .build();
        assert!(result.is_err());
    }
}
