//! Transport layer
//!
//! A transport is a duplex JSON-RPC byte channel to one MCP server over one
//! of four media: local subprocess stdio, remote subprocess over SSH,
//! subprocess inside a Docker container, or an HTTP endpoint. All variants
//! share one operation set — connect, disconnect, send, a framed event
//! stream, connectedness, last error — behind the [`Transport`] trait; the
//! factory dispatches on the transport discriminator of the server config.
//!
//! Framed variants (stdio, ssh, docker) run one reader task that splits the
//! byte stream on `\n`, parses each line as JSON-RPC, and pushes
//! [`TransportEvent`]s into the channel handed out by `connect`. The HTTP
//! variant has no long-lived reader; each POST's response is pushed into the
//! same channel so request correlation is uniform across media.

pub mod docker;
pub mod framing;
pub mod http;
pub mod ssh;
pub mod stdio;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::model::TransportConfig;
use crate::rpc::protocol::JsonRpcMessage;

pub use docker::DockerTransport;
pub use http::HttpTransport;
pub use ssh::SshTransport;
pub use stdio::StdioTransport;

/// Capacity of the event channel between a transport's reader and the
/// multiplexer.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 128;

/// What a transport delivers to its multiplexer.
#[derive(Debug)]
pub enum TransportEvent {
    /// One parsed JSON-RPC frame.
    Message(JsonRpcMessage),
    /// The channel is gone: EOF, process exit, session close, stream end.
    Closed { reason: String },
}

/// Uniform duplex channel to one MCP server.
///
/// `connect` may be called once; it returns the event stream the reader
/// feeds. All methods take `&self`: implementations keep their mutable
/// halves behind internal locks so a connected transport can be shared
/// between the multiplexer and the pool.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the channel and return the inbound event stream.
    ///
    /// On any failure every partially acquired resource (process, SSH
    /// channel, container, socket) is released before the error returns.
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Tear the channel down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Write one framed message.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn last_error(&self) -> Option<String>;
}

/// Build the transport variant matching a server's config.
pub fn build_transport(config: &TransportConfig, core: &CoreConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Stdio(cfg) => Arc::new(StdioTransport::new(cfg.clone())),
        TransportConfig::Ssh(cfg) => Arc::new(SshTransport::new(cfg.clone())),
        TransportConfig::Docker(cfg) => Arc::new(DockerTransport::new(cfg.clone())),
        TransportConfig::Http(cfg) => Arc::new(HttpTransport::new(cfg.clone(), core)),
    }
}
