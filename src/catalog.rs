//! Tool catalog
//!
//! Stores `(server_id, name) → Tool`. A discovery run replaces a server's
//! full tool set; tools absent from the latest discovery are removed.
//! `tools_for` is cached for 15 minutes and invalidated whenever discovery
//! writes for that server or the server is removed.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::model::Tool;
use crate::rpc::protocol::ToolDescriptor;
use crate::store::{Cache, CacheKey, ToolStore};

const TOOLS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Counts reported after a discovery write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogDiff {
    pub discovered: usize,
    pub removed: usize,
}

pub struct ToolCatalog {
    store: Arc<dyn ToolStore>,
    cache: Arc<dyn Cache>,
}

impl ToolCatalog {
    pub fn new(store: Arc<dyn ToolStore>, cache: Arc<dyn Cache>) -> Self {
        Self { store, cache }
    }

    /// Replace the server's tool set with the latest discovery result.
    ///
    /// Idempotent: applying the same descriptor set twice leaves the catalog
    /// identical and reports zero removals both times.
    pub async fn apply_discovery(
        &self,
        server_id: &str,
        descriptors: Vec<ToolDescriptor>,
    ) -> Result<CatalogDiff> {
        let previous = self.store.list_tools(server_id).await?;

        let mut tools: Vec<Tool> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let mut tool = Tool::from_descriptor(server_id, descriptor);
            // Keep the original discovery timestamp for unchanged tools so a
            // no-op rediscovery leaves rows identical.
            if let Some(existing) = previous
                .iter()
                .find(|t| t.name == tool.name && t.same_definition(&tool))
            {
                tool.discovered_at = existing.discovered_at;
            }
            tools.push(tool);
        }

        let removed = previous
            .iter()
            .filter(|old| !tools.iter().any(|new| new.name == old.name))
            .count();
        let discovered = tools.len();

        self.store.replace_server_tools(server_id, tools).await?;
        self.cache
            .invalidate(&CacheKey::ServerTools(server_id.to_string()))
            .await;

        Ok(CatalogDiff {
            discovered,
            removed,
        })
    }

    /// Insert or overwrite one tool outside a full discovery run.
    pub async fn upsert(&self, tool: Tool) -> Result<()> {
        let server_id = tool.server_id.clone();
        self.store.upsert_tool(tool).await?;
        self.cache
            .invalidate(&CacheKey::ServerTools(server_id))
            .await;
        Ok(())
    }

    pub async fn tools_for(&self, server_id: &str) -> Result<Vec<Tool>> {
        let key = CacheKey::ServerTools(server_id.to_string());
        if let Some(value) = self.cache.get(&key).await {
            if let Ok(tools) = serde_json::from_value::<Vec<Tool>>(value) {
                return Ok(tools);
            }
        }

        let tools = self.store.list_tools(server_id).await?;
        if let Ok(value) = serde_json::to_value(&tools) {
            self.cache.put(key, value, TOOLS_CACHE_TTL).await;
        }
        Ok(tools)
    }

    /// Cascade target for server deletion.
    pub async fn remove_server(&self, server_id: &str) -> Result<()> {
        self.store.delete_server_tools(server_id).await?;
        self.cache
            .invalidate(&CacheKey::ServerTools(server_id.to_string()))
            .await;
        Ok(())
    }
}
