//! Mutations that flow through the replicated log.
//!
//! The replica treats a mutation as an opaque JSON value; only the sink that
//! applies committed entries interprets it. The helpers here build and read
//! the `{op, path, content}` shape used by the bundled file-system sink.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Opaque application command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mutation(Value);

impl Mutation {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Builds a `write` mutation that stores `content` at `path`.
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self(json!({
            "op": "write",
            "path": path.into(),
            "content": content.into(),
        }))
    }

    /// Builds a `delete` mutation that removes `path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self(json!({
            "op": "delete",
            "path": path.into(),
        }))
    }

    pub fn op(&self) -> Option<&str> {
        self.0.get("op").and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.0.get("path").and_then(Value::as_str)
    }

    pub fn content(&self) -> Option<&str> {
        self.0.get("content").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Size of the serialized mutation in bytes, the figure compared
    /// against `max_entry_bytes`.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.0).map_or(usize::MAX, |bytes| bytes.len())
    }
}

impl From<Value> for Mutation {
    fn from(value: Value) -> Self {
        Self(value)
    }
}
