// MCP Integration Core
//
// Brokers access to a fleet of Model Context Protocol servers on behalf of
// internal clients. Servers are reachable over one of four transports
// (stdio subprocess, SSH remote command, Docker attach, HTTP) and speak
// JSON-RPC 2.0. The core registers servers, maintains pooled connections,
// discovers tools, and executes tool invocations with per-request
// correlation, timeouts, and cancellation.
//
// The REST surface, persistent store backends, and event bus backends live
// outside this crate; the core consumes them through the Store, Cache, and
// EventSink traits.

pub mod api;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod pool;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod transport;

// Re-export the surface upstream callers touch.
pub use api::{ConnectionTestReport, CoreBuilder, IntegrationCore};
pub use config::CoreConfig;
pub use discovery::{DiscoveryError, DiscoveryReport};
pub use engine::{ExecuteOptions, ExecuteRequest, ExecutionListQuery};
pub use error::{CoreError, Result};
pub use events::{DomainEvent, Event, EventPublisher, EventSink, MemorySink};
pub use model::{
    Execution, ExecutionFilter, ExecutionStatus, Page, Server, ServerFilter, ServerPatch,
    ServerSpec, ServerStatus, Tool, TransportConfig, TransportKind,
};
pub use pool::{ConnectionLease, ConnectionPool, DefaultTransportFactory, TransportFactory};
pub use registry::{ServerListQuery, ServerRegistry};
pub use store::{Cache, ExecutionStore, MemoryCache, MemoryStore, ServerStore, ToolStore};
pub use transport::{Transport, TransportEvent};
