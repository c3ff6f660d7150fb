//! Server registry
//!
//! CRUD over server configurations. Creates validate the transport config
//! before anything is persisted; updates may never change the transport
//! kind. Single-server reads and list queries are served from the injected
//! cache (5 min / 30 s TTLs); every mutation invalidates the affected
//! single entry and the whole list keyspace. Writes are serialised per
//! server id.
//!
//! The pool projects connection state onto server rows through
//! `set_connection_status` / `record_handshake` / `touch_health_check`;
//! those projections invalidate caches but do not emit `ServerUpdated`,
//! which is reserved for configuration mutations.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::{DomainEvent, EventPublisher};
use crate::model::{
    ConnectionStatus, Page, Server, ServerFilter, ServerPatch, ServerRuntimeInfo, ServerSpec,
    ServerStatus,
};
use crate::store::{Cache, CacheKey, CacheKeyspace, ServerStore};

const SERVER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const LIST_CACHE_TTL: Duration = Duration::from_secs(30);

/// One async mutex per key, so writes for different servers never contend.
struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("keyed locks poisoned");
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn forget(&self, key: &str) {
        self.locks.lock().expect("keyed locks poisoned").remove(key);
    }
}

/// List query: filter plus paging.
#[derive(Debug, Clone, Default)]
pub struct ServerListQuery {
    pub filter: ServerFilter,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ServerListQuery {
    fn cache_key(&self) -> CacheKey {
        CacheKey::ServerList(format!(
            "{};offset={};limit={}",
            self.filter.normalized_key(),
            self.offset,
            self.limit.map(|l| l.to_string()).unwrap_or_else(|| "*".to_string()),
        ))
    }
}

pub struct ServerRegistry {
    store: Arc<dyn ServerStore>,
    cache: Arc<dyn Cache>,
    events: EventPublisher,
    write_locks: KeyedLocks,
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn ServerStore>, cache: Arc<dyn Cache>, events: EventPublisher) -> Self {
        Self {
            store,
            cache,
            events,
            write_locks: KeyedLocks::new(),
        }
    }

    /// Register a new server. The row starts `inactive` and `disconnected`.
    pub async fn create(&self, spec: ServerSpec) -> Result<Server> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::Validation("server name must not be empty".to_string()));
        }
        spec.transport.validate()?;

        if self.store.find_server_by_name(&name).await?.is_some() {
            return Err(CoreError::Conflict(format!(
                "server name '{}' already exists",
                name
            )));
        }

        let now = Utc::now();
        let server = Server {
            id: Uuid::new_v4().to_string(),
            name,
            description: spec.description,
            transport: spec.transport,
            status: ServerStatus::Inactive,
            connection_status: ConnectionStatus::Disconnected,
            server_info: None,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
            last_health_check: None,
            last_error: None,
        };
        self.store.insert_server(server.clone()).await?;

        self.invalidate(&server.id).await;
        self.events.emit(DomainEvent::ServerRegistered {
            server_id: server.id.clone(),
            name: server.name.clone(),
        });
        Ok(server)
    }

    pub async fn get(&self, id: &str) -> Result<Server> {
        let key = CacheKey::Server(id.to_string());
        if let Some(value) = self.cache.get(&key).await {
            if let Ok(server) = serde_json::from_value::<Server>(value) {
                return Ok(server);
            }
        }

        let server = self
            .store
            .get_server(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("server {}", id)))?;
        if let Ok(value) = serde_json::to_value(&server) {
            self.cache.put(key, value, SERVER_CACHE_TTL).await;
        }
        Ok(server)
    }

    /// Uncached existence probe for callers that tolerate absence.
    pub async fn try_get(&self, id: &str) -> Result<Option<Server>> {
        self.store.get_server(id).await
    }

    pub async fn list(&self, query: &ServerListQuery) -> Result<Page<Server>> {
        let key = query.cache_key();
        if let Some(value) = self.cache.get(&key).await {
            if let Ok(page) = serde_json::from_value::<Page<Server>>(value) {
                return Ok(page);
            }
        }

        let all = self.store.list_servers(&query.filter).await?;
        let total = all.len();
        let items: Vec<Server> = all
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        let page = Page {
            limit: query.limit.unwrap_or(total),
            offset: query.offset,
            total,
            items,
        };
        if let Ok(value) = serde_json::to_value(&page) {
            self.cache.put(key, value, LIST_CACHE_TTL).await;
        }
        Ok(page)
    }

    /// Every `active` server, uncached, for the background loops.
    pub async fn list_active(&self) -> Result<Vec<Server>> {
        self.store
            .list_servers(&ServerFilter {
                status: Some(ServerStatus::Active),
                ..Default::default()
            })
            .await
    }

    /// Apply a partial update. The transport kind is immutable.
    pub async fn update(&self, id: &str, patch: ServerPatch) -> Result<Server> {
        let lock = self.write_locks.lock_for(id);
        let _guard = lock.lock().await;

        let mut server = self
            .store
            .get_server(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("server {}", id)))?;

        if let Some(transport) = patch.transport {
            if transport.kind() != server.transport.kind() {
                return Err(CoreError::TransportImmutable(format!(
                    "server {} transport is {}, cannot change to {}",
                    id,
                    server.transport.kind(),
                    transport.kind()
                )));
            }
            transport.validate()?;
            server.transport = transport;
        }
        if let Some(name) = patch.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(CoreError::Validation("server name must not be empty".to_string()));
            }
            if name != server.name {
                if let Some(existing) = self.store.find_server_by_name(&name).await? {
                    if existing.id != server.id {
                        return Err(CoreError::Conflict(format!(
                            "server name '{}' already exists",
                            name
                        )));
                    }
                }
                server.name = name;
            }
        }
        if let Some(description) = patch.description {
            server.description = Some(description);
        }
        if let Some(status) = patch.status {
            server.status = status;
        }
        if let Some(metadata) = patch.metadata {
            server.metadata = metadata;
        }
        server.updated_at = Utc::now();

        self.store.update_server(server.clone()).await?;
        self.invalidate(id).await;
        self.events.emit(DomainEvent::ServerUpdated {
            server_id: id.to_string(),
        });
        Ok(server)
    }

    /// Remove the server row. Tool and execution cascade is the facade's
    /// job, so the registry stays free of catalog dependencies.
    pub async fn delete(&self, id: &str) -> Result<Server> {
        let lock = self.write_locks.lock_for(id);
        let server = {
            let _guard = lock.lock().await;
            let server = self
                .store
                .get_server(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("server {}", id)))?;
            if !self.store.delete_server(id).await? {
                return Err(CoreError::NotFound(format!("server {}", id)));
            }
            server
        };
        self.write_locks.forget(id);

        self.invalidate(id).await;
        self.events.emit(DomainEvent::ServerDeleted {
            server_id: id.to_string(),
        });
        Ok(server)
    }

    /// Project a pool-owned connection transition onto the server row.
    pub async fn set_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let lock = self.write_locks.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut server) = self.store.get_server(id).await? else {
            // The server may be deleted while its connection winds down.
            debug!(server_id = %id, "connection status update for missing server, ignoring");
            return Ok(());
        };
        server.connection_status = status;
        if let Some(error) = last_error {
            server.last_error = Some(error);
        }
        self.store.update_server(server).await?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Store the handshake outcome on the server row.
    pub async fn record_handshake(&self, id: &str, info: ServerRuntimeInfo) -> Result<()> {
        let lock = self.write_locks.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut server) = self.store.get_server(id).await? else {
            return Ok(());
        };
        server.server_info = Some(info);
        server.connection_status = ConnectionStatus::Connected;
        server.last_error = None;
        self.store.update_server(server).await?;
        self.invalidate(id).await;
        Ok(())
    }

    pub async fn touch_health_check(&self, id: &str) -> Result<()> {
        let lock = self.write_locks.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut server) = self.store.get_server(id).await? else {
            return Ok(());
        };
        server.last_health_check = Some(Utc::now());
        self.store.update_server(server).await?;
        self.invalidate(id).await;
        Ok(())
    }

    async fn invalidate(&self, id: &str) {
        self.cache.invalidate(&CacheKey::Server(id.to_string())).await;
        self.cache.invalidate_space(CacheKeyspace::ServerList).await;
    }
}
