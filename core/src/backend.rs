//! Client side of the backend wire protocol.
//!
//! A backend is a long-lived child process speaking line-delimited JSON-RPC
//! over its standard streams. The host performs an `initialize` handshake
//! and a `tools/list` call at install time, then routes `tools/call`
//! requests per invocation. Responses are matched to requests by id through
//! a pending map of oneshot channels; a reader task owns stdout.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use capstan_protocol::CallToolParams;
use capstan_protocol::CallToolResult;
use capstan_protocol::InitializeResult;
use capstan_protocol::JsonRpcMessage;
use capstan_protocol::ListToolsResult;
use capstan_protocol::RequestId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::CapstanErr;
use crate::error::Result;

/// How to spawn a backend child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpawnSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl BackendSpawnSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: None,
            cwd: None,
        }
    }

    /// Parse a single command line, the form snapshots record.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut tokens = shlex::split(command_line)
            .ok_or_else(|| CapstanErr::Config(format!("invalid command: {command_line}")))?;
        if tokens.is_empty() {
            return Err(CapstanErr::Config("empty backend command".to_string()));
        }
        let command = tokens.remove(0);
        Ok(Self::new(command, tokens))
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<serde_json::Value>>>>>;

pub struct BackendClient {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
}

impl BackendClient {
    /// Spawn the backend child and start its reader task. The protocol
    /// handshake is a separate step so install can bound it with a timeout.
    pub async fn spawn(spec: &BackendSpawnSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(env) = &spec.env {
            cmd.envs(env);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapstanErr::Protocol("backend stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapstanErr::Protocol("backend stdout not captured".to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(BufReader::new(stdout), Arc::clone(&pending)));

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicI64::new(0),
            reader,
        })
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = JsonRpcMessage::request(RequestId::Integer(id), method, params);
        if let Err(err) = self.send(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CapstanErr::Protocol(
                "backend closed before responding".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CapstanErr::BackendTimeout(timeout, method.to_string()))
            }
        }
    }

    /// The `initialize` handshake followed by the initialized notification.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult> {
        let params = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "capstan", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self.request("initialize", Some(params), timeout).await?;
        let initialized: InitializeResult = serde_json::from_value(result)?;
        self.send(&JsonRpcMessage::notification(
            "notifications/initialized",
            None,
        ))
        .await?;
        Ok(initialized)
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<ListToolsResult> {
        let result = self.request("tools/list", None, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.request("tools/call", Some(params), timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Best-effort shutdown: kill the child and stop the reader.
    pub async fn shutdown(&self) {
        self.reader.abort();
        let mut child = self.child.lock().await;
        if let Err(err) = child.start_kill() {
            debug!("backend kill failed (already exited?): {err}");
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    }
}

async fn read_loop(reader: BufReader<tokio::process::ChildStdout>, pending: Pending) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("backend stdout read failed: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message: JsonRpcMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!("ignoring malformed backend line: {err}");
                continue;
            }
        };
        match message {
            JsonRpcMessage::Response(response) => {
                route(&pending, &response.id, Ok(response.result)).await;
            }
            JsonRpcMessage::Error(error) => {
                let detail = error.error.message.clone();
                route(&pending, &error.id, Err(CapstanErr::Backend(detail))).await;
            }
            JsonRpcMessage::Notification(notification) => {
                debug!("backend notification: {}", notification.method);
            }
            JsonRpcMessage::Request(request) => {
                // Server-initiated requests (sampling, elicitation) are out
                // of scope; the backend gets a clean refusal.
                warn!("refusing backend-initiated request: {}", request.method);
            }
        }
    }

    // Wake every waiter so callers fail fast instead of hanging.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CapstanErr::Protocol(
            "backend closed its stdout".to_string(),
        )));
    }
}

async fn route(pending: &Pending, id: &RequestId, result: Result<serde_json::Value>) {
    let RequestId::Integer(id) = id else {
        warn!("backend responded with non-integer id");
        return;
    };
    let tx = pending.lock().await.remove(id);
    match tx {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => warn!("backend response for unknown id {id}"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn spawn_spec_parses_command_lines() {
        let spec = BackendSpawnSpec::parse("math-server --stdio --level 2").expect("parse");
        assert_eq!(spec.command, "math-server");
        assert_eq!(spec.args, vec!["--stdio", "--level", "2"]);
        assert_eq!(spec.command_line(), "math-server --stdio --level 2");
    }

    #[test]
    fn spawn_spec_rejects_bad_lines() {
        assert!(BackendSpawnSpec::parse("").is_err());
        assert!(BackendSpawnSpec::parse("broken 'quote").is_err());
    }
}
