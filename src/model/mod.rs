//! Persistent data model: servers, tools, executions.

pub mod execution;
pub mod server;
pub mod tool;

pub use execution::{Execution, ExecutionFilter, ExecutionStatus};
pub use server::{
    AdvertisedCapabilities, ConnectionStatus, DockerConfig, HttpConfig, Page, Server, ServerFilter,
    ServerPatch, ServerRuntimeInfo, ServerSpec, ServerStatus, SshConfig, SshCredential,
    StdioConfig, TransportConfig, TransportKind,
};
pub use tool::Tool;
