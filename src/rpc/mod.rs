//! JSON-RPC plumbing: wire types and the per-connection multiplexer.

pub mod mux;
pub mod protocol;

pub use mux::{Multiplexer, NotificationHandler, RpcError};
pub use protocol::{
    ErrorObject, InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ToolCallParams, ToolCallResult, ToolDescriptor, ToolsListResult,
    CLIENT_NAME, CLIENT_VERSION, JSONRPC_VERSION, PROTOCOL_VERSION,
};
