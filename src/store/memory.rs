//! In-memory store backend
//!
//! Backs tests and stand-alone embedding. Enforces the same constraints the
//! abstract schema names: servers keyed by id with a unique name, tools
//! keyed by `(server_id, name)`, executions keyed by id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::model::{Execution, ExecutionFilter, Server, ServerFilter, Tool};

use super::traits::{ExecutionStore, ServerStore, ToolStore};

/// Default store keeping all three tables in process memory.
#[derive(Default)]
pub struct MemoryStore {
    servers: RwLock<HashMap<String, Server>>,
    tools: RwLock<HashMap<(String, String), Tool>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn insert_server(&self, server: Server) -> Result<()> {
        let mut servers = self.servers.write().await;
        if servers.contains_key(&server.id) {
            return Err(CoreError::Conflict(format!(
                "server id {} already exists",
                server.id
            )));
        }
        if servers.values().any(|s| s.name == server.name) {
            return Err(CoreError::Conflict(format!(
                "server name '{}' already exists",
                server.name
            )));
        }
        servers.insert(server.id.clone(), server);
        Ok(())
    }

    async fn update_server(&self, server: Server) -> Result<()> {
        let mut servers = self.servers.write().await;
        if !servers.contains_key(&server.id) {
            return Err(CoreError::NotFound(format!("server {}", server.id)));
        }
        if servers
            .values()
            .any(|s| s.id != server.id && s.name == server.name)
        {
            return Err(CoreError::Conflict(format!(
                "server name '{}' already exists",
                server.name
            )));
        }
        servers.insert(server.id.clone(), server);
        Ok(())
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>> {
        Ok(self.servers.read().await.get(id).cloned())
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>> {
        Ok(self
            .servers
            .read()
            .await
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>> {
        let mut matched: Vec<Server> = self
            .servers
            .read()
            .await
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn delete_server(&self, id: &str) -> Result<bool> {
        Ok(self.servers.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl ToolStore for MemoryStore {
    async fn upsert_tool(&self, tool: Tool) -> Result<()> {
        let key = (tool.server_id.clone(), tool.name.clone());
        self.tools.write().await.insert(key, tool);
        Ok(())
    }

    async fn replace_server_tools(&self, server_id: &str, tools: Vec<Tool>) -> Result<()> {
        let mut table = self.tools.write().await;
        table.retain(|(sid, _), _| sid != server_id);
        for tool in tools {
            table.insert((server_id.to_string(), tool.name.clone()), tool);
        }
        Ok(())
    }

    async fn list_tools(&self, server_id: &str) -> Result<Vec<Tool>> {
        let mut tools: Vec<Tool> = self
            .tools
            .read()
            .await
            .iter()
            .filter(|((sid, _), _)| sid == server_id)
            .map(|(_, tool)| tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn delete_server_tools(&self, server_id: &str) -> Result<()> {
        self.tools
            .write()
            .await
            .retain(|(sid, _), _| sid != server_id);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn put_execution(&self, execution: Execution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut matched: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matched)
    }

    async fn prune_executions(&self, server_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, e| !(e.server_id == server_id && e.started_at < cutoff));
        Ok(before - executions.len())
    }
}
