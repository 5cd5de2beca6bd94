//! Durable snapshot of a session worker's user-visible namespace.

use serde::Deserialize;
use serde::Serialize;

pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    /// RFC 3339 timestamp, stamped by the state store at save time.
    #[serde(default)]
    pub saved_at: String,
    #[serde(default)]
    pub functions: Vec<SavedFunction>,
    #[serde(default)]
    pub variables: Vec<SavedVariable>,
    #[serde(default)]
    pub capabilities: Vec<SavedCapability>,
    #[serde(default)]
    pub history: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFunction {
    pub name: String,
    /// Full source text of the definition block.
    pub source: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub docstring: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    /// The payload is the value itself, round-trippable through JSON.
    Value,
    /// Only a textual representation could be captured; such entries are
    /// surfaced as restore failures on import.
    Repr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedVariable {
    pub name: String,
    pub kind: VariableKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Native,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedCapability {
    pub name: String,
    pub kind: CapabilityKind,
    /// Definition source, for natives whose source was recoverable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Spawn command line, for relay capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn snapshot_round_trips() {
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: "2026-01-01T00:00:00Z".to_string(),
            functions: vec![SavedFunction {
                name: "inc".to_string(),
                source: "def inc(x):\n    return x + 1\n".to_string(),
                signature: "(x)".to_string(),
                docstring: String::new(),
            }],
            variables: vec![SavedVariable {
                name: "counter".to_string(),
                kind: VariableKind::Value,
                payload: json!(5),
            }],
            capabilities: vec![SavedCapability {
                name: "math".to_string(),
                kind: CapabilityKind::Relay,
                source: None,
                command: Some("math-server --stdio".to_string()),
            }],
            history: vec!["counter = 5".to_string()],
        };

        let text = serde_json::to_string(&snapshot).expect("serialize");
        let back: SessionSnapshot = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let snapshot: SessionSnapshot = serde_json::from_value(json!({})).expect("parse");
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert!(snapshot.functions.is_empty());
        assert!(snapshot.history.is_empty());
    }
}
