//! Typed tool table entries shared by the relay hub and the worker.

use serde::Deserialize;
use serde::Serialize;

/// One entry of a relay capability's tool table: what the backend said the
/// tool does and the JSON schema of its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub description: String,
    /// JSON schema for the tool's arguments, verbatim from the backend.
    #[serde(default)]
    pub parameters: serde_json::Value,
}
