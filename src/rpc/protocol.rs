//! JSON-RPC 2.0 and MCP wire types
//!
//! Every MCP server is addressed by JSON-RPC 2.0. Request ids are generated
//! strictly as `u64` counters per connection; the protocol permits strings
//! too, but servers echo what was sent, so the core never parses string ids
//! on its own traffic.
//!
//! MCP protocol reference: https://spec.modelcontextprotocol.io/specification/2024-11-05/

use serde::{Deserialize, Serialize};

/// JSON-RPC version field, always "2.0".
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version the core implements.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent during the handshake.
pub const CLIENT_NAME: &str = "mcp-integration";

/// Client version sent during the handshake.
pub const CLIENT_VERSION: &str = "1";

/// JSON-RPC 2.0 request.
///
/// ```json
/// {"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification: a request without an id, never answered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response. Either `result` or `error` is present, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// JSON-RPC 2.0 error object.
///
/// Standard codes: -32700 parse error, -32600 invalid request, -32601 method
/// not found, -32602 invalid params, -32603 internal error, -32000..-32099
/// server-defined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Any frame a transport can deliver or accept.
///
/// Untagged variant order matters: a request carries `method` + `id`, a
/// notification carries `method` without `id`, everything else with an `id`
/// is a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

// --- MCP method params/results -------------------------------------------

/// Params for the mandatory `initialize` exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    #[serde(rename = "clientInfo")]
    pub client_info: PeerInfo,
}

impl InitializeParams {
    /// The fixed handshake the core sends on every new connection.
    pub fn client_default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {
                tools: true,
                resources: true,
                prompts: true,
                logging: true,
            },
            client_info: PeerInfo {
                name: CLIENT_NAME.to_string(),
                version: CLIENT_VERSION.to_string(),
            },
        }
    }
}

/// Capabilities the core advertises to servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
}

/// Name/version pair identifying either side of the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

/// Result of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: PeerInfo,
}

/// Capabilities a server advertises.
///
/// Servers send either booleans or capability objects per feature; presence
/// of anything but `false`/`null` counts as advertised.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<serde_json::Value>,
}

fn advertised(value: &Option<serde_json::Value>) -> bool {
    !matches!(
        value,
        None | Some(serde_json::Value::Bool(false)) | Some(serde_json::Value::Null)
    )
}

impl ServerCapabilities {
    pub fn supports_tools(&self) -> bool {
        advertised(&self.tools)
    }

    pub fn supports_resources(&self) -> bool {
        advertised(&self.resources)
    }

    pub fn supports_prompts(&self) -> bool {
        advertised(&self.prompts)
    }

    pub fn supports_logging(&self) -> bool {
        advertised(&self.logging)
    }
}

/// One tool as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Result of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}

/// Params for `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// One content block of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Params of an inbound `notifications/message` log notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageParams {
    pub level: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_message_untagged_dispatch() {
        let m: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(m, JsonRpcMessage::Response(_)));

        let m: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#).unwrap();
        assert!(matches!(m, JsonRpcMessage::Request(_)));

        let m: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"hi"}}"#,
        )
        .unwrap();
        assert!(matches!(m, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn test_response_error_branch() {
        let m: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match m {
            JsonRpcMessage::Response(resp) => {
                assert!(resp.result.is_none());
                let error = resp.error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_params_shape() {
        let params = InitializeParams::client_default();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["protocolVersion"], "2024-11-05");
        assert_eq!(json["capabilities"]["tools"], true);
        assert_eq!(json["capabilities"]["logging"], true);
        assert_eq!(json["clientInfo"]["name"], "mcp-integration");
        assert_eq!(json["clientInfo"]["version"], "1");
    }

    #[test]
    fn test_initialize_result_deserialization() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {}, "logging": false },
            "serverInfo": { "name": "echo-server", "version": "1.0.0" }
        }))
        .unwrap();

        assert!(result.capabilities.supports_tools());
        assert!(!result.capabilities.supports_logging());
        assert!(!result.capabilities.supports_prompts());
        assert_eq!(result.server_info.name, "echo-server");
    }

    #[test]
    fn test_tool_descriptor_deserialization() {
        let tool: ToolDescriptor = serde_json::from_value(json!({
            "name": "echo",
            "description": "Echo a message",
            "inputSchema": {
                "type": "object",
                "properties": { "msg": { "type": "string" } },
                "required": ["msg"]
            }
        }))
        .unwrap();

        assert_eq!(tool.name, "echo");
        assert!(tool.input_schema.is_object());
        assert!(tool.version.is_none());
    }

    #[test]
    fn test_tool_call_result_error_flag() {
        let result: ToolCallResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "boom" }],
            "isError": true
        }))
        .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result.content[0].text, "boom");
    }
}
