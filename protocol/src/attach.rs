//! Attach endpoint line protocol.
//!
//! Attach clients connect over a local stream socket and submit one request
//! per line; the server answers with a single JSON line. The response shapes
//! are op-specific, so the server side builds them with `serde_json::json!`.

use serde::Deserialize;
use serde::Serialize;

use crate::snapshot::SessionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachOp {
    Ping,
    Execute,
    State,
    ListCapabilities,
    DescribeCapability,
    ExportState,
    ImportState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachRequest {
    pub op: AttachOp,
    /// Block for the runtime mutex instead of failing fast with "busy".
    #[serde(default)]
    pub wait: bool,
    /// Upper bound in seconds on a blocking acquisition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionSnapshot>,
}

impl AttachRequest {
    pub fn bare(op: AttachOp) -> Self {
        Self {
            op,
            wait: false,
            timeout: None,
            code: None,
            name: None,
            state: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn execute_request_parses_with_optional_fields() {
        let request: AttachRequest =
            serde_json::from_value(json!({"op": "execute", "code": "1 + 1", "wait": true}))
                .expect("parse");
        assert_eq!(request.op, AttachOp::Execute);
        assert_eq!(request.code.as_deref(), Some("1 + 1"));
        assert!(request.wait);
        assert_eq!(request.timeout, None);
    }

    #[test]
    fn ping_request_is_minimal() {
        let request: AttachRequest = serde_json::from_value(json!({"op": "ping"})).expect("parse");
        assert_eq!(request.op, AttachOp::Ping);
        assert!(!request.wait);
    }
}
