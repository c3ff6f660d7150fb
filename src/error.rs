// Centralized error handling using thiserror for type-safe error management
//
// Every failure surfaced to callers maps to one of these variants. The
// JSON-RPC error codes recorded on failed executions are derived from the
// variant via `rpc_code()`.

use thiserror::Error;

/// Main error type for the integration core
///
/// Usage:
///     fn lookup(id: &str) -> Result<Server> {
///         store.get_server(id)?
///             .ok_or_else(|| CoreError::NotFound(format!("server {id}")))
///     }
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad server config, missing required transport fields, invalid URL
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown serverId / executionId
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate server name
    #[error("conflict: {0}")]
    Conflict(String),

    /// Update request attempted to change the transport field
    #[error("transport is immutable: {0}")]
    TransportImmutable(String),

    /// Transport open failed, handshake rejected, or connection closed mid-request
    #[error("connection error: {0}")]
    Connection(String),

    /// All pool slots are in use and nothing is evictable
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Per-request deadline elapsed
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Execution explicitly cancelled by the caller
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// JSON-RPC error object returned by the server (not a core failure)
    #[error("tool error {code}: {message}")]
    Tool {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Store backend failure
    #[error("store error: {0}")]
    Store(String),

    /// Unexpected invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// IO operation failed (process spawn, pipe, socket)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Type alias for Result with CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// JSON-RPC error codes recorded on failed executions.
pub mod codes {
    /// Server missing or not active.
    pub const SERVER_UNAVAILABLE: i64 = -32001;
    /// Execution stuck in `running` past the sweeper threshold.
    pub const STUCK_TIMEOUT: i64 = -32002;
    /// Transport open failed or connection closed mid-request.
    pub const CONNECTION_ERROR: i64 = -32603;
    /// Per-request deadline elapsed.
    pub const TIMEOUT: i64 = -32000;
    /// Sentinel carried by the failure event of a cancelled execution.
    pub const CANCELLED: i64 = -32800;
    /// Standard JSON-RPC method-not-found, used for ping fallback detection.
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

impl CoreError {
    /// JSON-RPC error code an execution records when it fails with this error.
    pub fn rpc_code(&self) -> i64 {
        match self {
            CoreError::Timeout(_) => codes::TIMEOUT,
            CoreError::Cancelled(_) => codes::CANCELLED,
            CoreError::NotFound(_) | CoreError::Validation(_) => codes::SERVER_UNAVAILABLE,
            CoreError::Tool { code, .. } => *code,
            _ => codes::CONNECTION_ERROR,
        }
    }
}
