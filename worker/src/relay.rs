//! The worker's side of the inline relay sub-protocol, plus the wire
//! abstraction the command loop runs over.
//!
//! Relay traffic must use the worker's *real* standard streams: the
//! captured stdout/stderr buffers used by `execute` stay local. A relay
//! call writes one `relay_request` line and blocks reading the matching
//! `relay_response` line; ids are monotonic and checked on return.

use std::io;
use std::io::BufRead;
use std::io::StdinLock;
use std::io::StdoutLock;
use std::io::Write;

use capstan_protocol::RelayFrame;

use crate::interp::error::ScriptError;

/// One line out, one line in. The command loop and the relay sub-protocol
/// share this so both directions stay strictly serialized.
pub trait Wire {
    fn send_line(&mut self, line: &str) -> io::Result<()>;
    /// `None` on EOF.
    fn recv_line(&mut self) -> io::Result<Option<String>>;
}

pub struct StdioWire {
    stdin: StdinLock<'static>,
    stdout: StdoutLock<'static>,
}

impl StdioWire {
    pub fn new() -> Self {
        Self {
            stdin: io::stdin().lock(),
            stdout: io::stdout().lock(),
        }
    }
}

impl Default for StdioWire {
    fn default() -> Self {
        Self::new()
    }
}

impl Wire for StdioWire {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stdout.write_all(line.as_bytes())?;
        self.stdout.write_all(b"\n")?;
        self.stdout.flush()
    }

    fn recv_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.stdin.read_line(&mut line)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

/// How relay-capability calls reach the host during `execute`.
pub trait RelayPort {
    fn call(
        &mut self,
        capability: &str,
        method: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ScriptError>;
}

/// Used outside `execute` (inject, import) where relay calls cannot occur.
pub struct NoRelay;

impl RelayPort for NoRelay {
    fn call(
        &mut self,
        capability: &str,
        method: &str,
        _arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ScriptError> {
        Err(ScriptError::relay(format!(
            "no relay handler available for {capability}.{method}"
        )))
    }
}

/// Live relay over the worker's wire, sharing the session's monotonic id
/// counter.
pub struct WireRelay<'a> {
    pub wire: &'a mut dyn Wire,
    pub next_id: &'a mut u64,
}

impl RelayPort for WireRelay<'_> {
    fn call(
        &mut self,
        capability: &str,
        method: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, ScriptError> {
        *self.next_id += 1;
        let id = *self.next_id;

        let request = RelayFrame::RelayRequest {
            id,
            capability: capability.to_string(),
            method: method.to_string(),
            arguments,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| ScriptError::relay(format!("cannot encode relay request: {e}")))?;
        self.wire
            .send_line(&line)
            .map_err(|e| ScriptError::relay(format!("cannot reach the host: {e}")))?;

        let response = self
            .wire
            .recv_line()
            .map_err(|e| ScriptError::relay(format!("cannot read relay response: {e}")))?
            .ok_or_else(|| ScriptError::relay("host closed the connection during relay"))?;

        let frame: RelayFrame = serde_json::from_str(response.trim())
            .map_err(|e| ScriptError::relay(format!("malformed relay response: {e}")))?;
        let RelayFrame::RelayResponse {
            id: response_id,
            success,
            result,
            error,
        } = frame
        else {
            return Err(ScriptError::relay("unexpected frame kind during relay"));
        };
        if response_id != id {
            return Err(ScriptError::relay(format!(
                "relay response id mismatch: expected {id}, got {response_id}"
            )));
        }
        if success {
            Ok(result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(ScriptError::relay(format!(
                "relay call failed: {}",
                error.unwrap_or_else(|| "unknown error".to_string())
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// Scripted wire for tests: records sent lines, replays queued
    /// responses.
    pub struct ScriptedWire {
        pub sent: Vec<String>,
        pub responses: VecDeque<String>,
    }

    impl Wire for ScriptedWire {
        fn send_line(&mut self, line: &str) -> io::Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn recv_line(&mut self) -> io::Result<Option<String>> {
            Ok(self.responses.pop_front())
        }
    }

    #[test]
    fn relay_round_trip_checks_id() {
        let mut wire = ScriptedWire {
            sent: Vec::new(),
            responses: VecDeque::from([
                r#"{"type":"relay_response","id":1,"success":true,"result":7}"#.to_string(),
            ]),
        };
        let mut next_id = 0;
        let mut relay = WireRelay {
            wire: &mut wire,
            next_id: &mut next_id,
        };
        let mut arguments = serde_json::Map::new();
        arguments.insert("a".to_string(), json!(3));
        let result = relay.call("math", "add", arguments).expect("relay");
        assert_eq!(result, json!(7));
        assert_eq!(next_id, 1);

        let sent: serde_json::Value = serde_json::from_str(&wire.sent[0]).expect("parse");
        assert_eq!(sent["type"], "relay_request");
        assert_eq!(sent["id"], 1);
        assert_eq!(sent["capability"], "math");
    }

    #[test]
    fn mismatched_id_is_an_error() {
        let mut wire = ScriptedWire {
            sent: Vec::new(),
            responses: VecDeque::from([
                r#"{"type":"relay_response","id":99,"success":true,"result":null}"#.to_string(),
            ]),
        };
        let mut next_id = 0;
        let mut relay = WireRelay {
            wire: &mut wire,
            next_id: &mut next_id,
        };
        let err = relay
            .call("math", "add", serde_json::Map::new())
            .err()
            .expect("error");
        assert_eq!(err.kind, "RelayError");
        assert!(err.message.contains("mismatch"), "{}", err.message);
    }

    #[test]
    fn failure_becomes_a_raised_error() {
        let mut wire = ScriptedWire {
            sent: Vec::new(),
            responses: VecDeque::from([
                r#"{"type":"relay_response","id":1,"success":false,"error":"boom"}"#.to_string(),
            ]),
        };
        let mut next_id = 0;
        let mut relay = WireRelay {
            wire: &mut wire,
            next_id: &mut next_id,
        };
        let err = relay
            .call("math", "add", serde_json::Map::new())
            .err()
            .expect("error");
        assert!(err.message.contains("boom"), "{}", err.message);
    }

    #[test]
    fn eof_during_relay_is_reported() {
        let mut wire = ScriptedWire {
            sent: Vec::new(),
            responses: VecDeque::new(),
        };
        let mut next_id = 0;
        let mut relay = WireRelay {
            wire: &mut wire,
            next_id: &mut next_id,
        };
        let err = relay
            .call("math", "add", serde_json::Map::new())
            .err()
            .expect("error");
        assert!(err.message.contains("closed"), "{}", err.message);
    }
}
