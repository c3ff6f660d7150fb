// Store trait definitions for dependency injection
//
// The core never talks to a database directly: servers, tools, and
// executions go through these traits, injected at startup. The in-memory
// implementations in `memory.rs` back tests and stand-alone embedding;
// production backends live outside this crate.
//
// All traits are Send + Sync so implementations can be shared across tokio
// tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Execution, ExecutionFilter, Server, ServerFilter, Tool};

/// Persistence for server rows. Keyed by `id`, unique constraint on `name`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Insert a new server.
    ///
    /// # Errors
    /// - `Conflict` when the id or name is already taken
    async fn insert_server(&self, server: Server) -> Result<()>;

    /// Overwrite an existing server row.
    ///
    /// # Errors
    /// - `NotFound` when the id is unknown
    /// - `Conflict` when the new name collides with another server
    async fn update_server(&self, server: Server) -> Result<()>;

    async fn get_server(&self, id: &str) -> Result<Option<Server>>;

    async fn find_server_by_name(&self, name: &str) -> Result<Option<Server>>;

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>>;

    /// Remove a server row. Returns false when the id was unknown.
    async fn delete_server(&self, id: &str) -> Result<bool>;
}

/// Persistence for tool rows, composite key `(server_id, name)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// Insert or overwrite one tool. Idempotent on `(server_id, name)`.
    async fn upsert_tool(&self, tool: Tool) -> Result<()>;

    /// Replace the full tool set of one server; tools absent from `tools`
    /// are removed.
    async fn replace_server_tools(&self, server_id: &str, tools: Vec<Tool>) -> Result<()>;

    async fn list_tools(&self, server_id: &str) -> Result<Vec<Tool>>;

    async fn delete_server_tools(&self, server_id: &str) -> Result<()>;
}

/// Persistence for executions. Keyed by `id`, queried by server and time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or overwrite one execution row.
    async fn put_execution(&self, execution: Execution) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;

    /// Delete executions of one server started before `cutoff`. Returns the
    /// number removed.
    async fn prune_executions(&self, server_id: &str, cutoff: DateTime<Utc>) -> Result<usize>;
}
