//! Tool entity
//!
//! A tool exposed by one server. `(server_id, name)` is unique; a tool row
//! exists only while its server exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rpc::protocol::ToolDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub server_id: String,
    /// Unique within the server.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool's `params` object.
    pub input_schema: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

impl Tool {
    /// Build a tool row from a `tools/list` descriptor.
    pub fn from_descriptor(server_id: &str, descriptor: ToolDescriptor) -> Self {
        Self {
            server_id: server_id.to_string(),
            name: descriptor.name,
            description: descriptor.description,
            input_schema: descriptor.input_schema,
            version: descriptor.version,
            discovered_at: Utc::now(),
        }
    }

    /// True when a rediscovered descriptor carries no observable change.
    pub fn same_definition(&self, other: &Tool) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.input_schema == other.input_schema
            && self.version == other.version
    }
}
