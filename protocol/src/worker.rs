//! Host <-> session-worker protocol.
//!
//! The host writes one [`WorkerCommand`] per line on the worker's stdin and
//! reads one response line per command from its stdout. During `execute` the
//! worker may interleave [`RelayFrame::RelayRequest`] lines, each of which
//! the host must answer with a [`RelayFrame::RelayResponse`] line on stdin
//! before the final execute response arrives.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::snapshot::CapabilityKind;
use crate::snapshot::SessionSnapshot;
use crate::tools::ToolSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Ping,
    Execute {
        code: String,
    },
    State,
    /// Run `code` in the user namespace, binding whatever it defines.
    Inject {
        name: String,
        code: String,
    },
    InjectRelayCapability {
        name: String,
        tools: BTreeMap<String, ToolSpec>,
    },
    RegisterCapability {
        name: String,
    },
    ListCapabilities,
    ExportState,
    ImportState {
        state: SessionSnapshot,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub pong: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Present only when the submitted code was a single expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub docstring: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub functions: Vec<FunctionInfo>,
    /// Variable name -> short type description.
    pub variables: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub history_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityListing {
    pub name: String,
    pub kind: CapabilityKind,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListCapabilitiesResponse {
    pub capabilities: Vec<CapabilityListing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub functions_restored: usize,
    #[serde(default)]
    pub functions_failed: Vec<RestoreFailure>,
    pub variables_restored: usize,
    #[serde(default)]
    pub variables_failed: Vec<RestoreFailure>,
    pub capabilities_restored: usize,
    #[serde(default)]
    pub capabilities_failed: Vec<RestoreFailure>,
    /// Relay capabilities the host must reconnect and re-inject.
    #[serde(default)]
    pub relay_capabilities_to_restore: Vec<String>,
}

/// Frames of the inline relay sub-protocol carried over the worker's real
/// standard streams during `execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    RelayRequest {
        /// Monotonic per-worker counter; the response must echo it.
        id: u64,
        capability: String,
        method: String,
        #[serde(default)]
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    RelayResponse {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RelayFrame {
    /// Returns true when a raw protocol line is a relay request that the
    /// host must service before the command response arrives.
    pub fn is_relay_request(value: &serde_json::Value) -> bool {
        value.get("type").and_then(|t| t.as_str()) == Some("relay_request")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn execute_command_wire_shape() {
        let cmd = WorkerCommand::Execute {
            code: "x = 1".to_string(),
        };
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(value, json!({"type": "execute", "code": "x = 1"}));
    }

    #[test]
    fn relay_frames_round_trip() {
        let line = r#"{"type":"relay_request","id":3,"capability":"math","method":"add","arguments":{"a":3,"b":4}}"#;
        let frame: RelayFrame = serde_json::from_str(line).expect("parse");
        match &frame {
            RelayFrame::RelayRequest {
                id,
                capability,
                method,
                arguments,
            } => {
                assert_eq!(*id, 3);
                assert_eq!(capability, "math");
                assert_eq!(method, "add");
                assert_eq!(arguments.get("a"), Some(&json!(3)));
            }
            other => panic!("expected relay request, got {other:?}"),
        }

        let raw: serde_json::Value = serde_json::from_str(line).expect("parse");
        assert!(RelayFrame::is_relay_request(&raw));
    }

    #[test]
    fn relay_response_omits_empty_slots() {
        let frame = RelayFrame::RelayResponse {
            id: 7,
            success: false,
            result: None,
            error: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            value,
            json!({"type": "relay_response", "id": 7, "success": false, "error": "boom"})
        );
    }
}
