//! Host-side handle to the session-worker child process.
//!
//! The worker speaks one JSON command per line on stdin and answers with
//! one JSON line on stdout. During `execute` it may interleave relay
//! requests, which the handle services through the caller-provided relay
//! callback before the final response arrives. The protocol is strictly
//! serial: one outstanding command at a time, enforced upstream by the
//! runtime mutex.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use capstan_protocol::AckResponse;
use capstan_protocol::ExecuteResponse;
use capstan_protocol::ImportReport;
use capstan_protocol::ListCapabilitiesResponse;
use capstan_protocol::PingResponse;
use capstan_protocol::RegisterResponse;
use capstan_protocol::RelayFrame;
use capstan_protocol::SessionSnapshot;
use capstan_protocol::StateResponse;
use capstan_protocol::ToolSpec;
use capstan_protocol::WorkerCommand;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tracing::debug;

use crate::error::CapstanErr;
use crate::error::Result;

/// How to spawn a worker child. Dependency-injected so tests can substitute
/// their own program.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerSpawnSpec {
    /// The default worker is this very executable re-run with the `worker`
    /// subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
        })
    }
}

pub struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerHandle {
    /// Spawn the worker and verify it answers a ping.
    pub async fn spawn(spec: &WorkerSpawnSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapstanErr::Protocol("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapstanErr::Protocol("worker stdout not captured".to_string()))?;

        let mut handle = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        let pong: PingResponse = handle.request(&WorkerCommand::Ping).await?;
        if !pong.pong {
            return Err(CapstanErr::Protocol(
                "worker failed its startup ping".to_string(),
            ));
        }
        Ok(handle)
    }

    fn ensure_alive(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(_)) | Err(_) => Err(CapstanErr::WorkerDied),
        }
    }

    async fn send_line(&mut self, value: &impl serde::Serialize) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_value(&mut self) -> Result<serde_json::Value> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(CapstanErr::WorkerDied);
        }
        Ok(serde_json::from_str(line.trim())
            .map_err(|e| CapstanErr::Protocol(format!("malformed worker line: {e}")))?)
    }

    /// One command, one response; any relay request here is a protocol
    /// violation because only `execute` may relay.
    async fn request<T: DeserializeOwned>(&mut self, command: &WorkerCommand) -> Result<T> {
        self.ensure_alive()?;
        self.send_line(command).await?;
        let value = self.read_value().await?;
        if RelayFrame::is_relay_request(&value) {
            return Err(CapstanErr::Protocol(
                "unexpected relay request outside execute".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)
            .map_err(|e| CapstanErr::Protocol(format!("unexpected worker response: {e}")))?)
    }

    pub async fn ping(&mut self) -> Result<bool> {
        let response: PingResponse = self.request(&WorkerCommand::Ping).await?;
        Ok(response.pong)
    }

    /// Execute code, servicing inline relay requests through `relay`.
    pub async fn execute<F, Fut>(&mut self, code: &str, relay: F) -> Result<ExecuteResponse>
    where
        F: Fn(String, String, serde_json::Map<String, serde_json::Value>) -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, String>>,
    {
        self.ensure_alive()?;
        self.send_line(&WorkerCommand::Execute {
            code: code.to_string(),
        })
        .await?;

        loop {
            let value = self.read_value().await?;
            if !RelayFrame::is_relay_request(&value) {
                return Ok(serde_json::from_value(value).map_err(|e| {
                    CapstanErr::Protocol(format!("unexpected execute response: {e}"))
                })?);
            }

            let frame: RelayFrame = serde_json::from_value(value)
                .map_err(|e| CapstanErr::Protocol(format!("malformed relay request: {e}")))?;
            let RelayFrame::RelayRequest {
                id,
                capability,
                method,
                arguments,
            } = frame
            else {
                return Err(CapstanErr::Protocol(
                    "worker sent a relay response as a request".to_string(),
                ));
            };
            debug!(id, capability, method, "relay request");

            let response = match relay(capability, method, arguments).await {
                Ok(result) => RelayFrame::RelayResponse {
                    id,
                    success: true,
                    result: Some(result),
                    error: None,
                },
                Err(error) => RelayFrame::RelayResponse {
                    id,
                    success: false,
                    result: None,
                    error: Some(error),
                },
            };
            self.send_line(&response).await?;
        }
    }

    pub async fn state(&mut self) -> Result<StateResponse> {
        self.request(&WorkerCommand::State).await
    }

    pub async fn inject(&mut self, name: &str, code: &str) -> Result<AckResponse> {
        self.request(&WorkerCommand::Inject {
            name: name.to_string(),
            code: code.to_string(),
        })
        .await
    }

    pub async fn inject_relay_capability(
        &mut self,
        name: &str,
        tools: BTreeMap<String, ToolSpec>,
    ) -> Result<AckResponse> {
        self.request(&WorkerCommand::InjectRelayCapability {
            name: name.to_string(),
            tools,
        })
        .await
    }

    pub async fn register_capability(&mut self, name: &str) -> Result<RegisterResponse> {
        self.request(&WorkerCommand::RegisterCapability {
            name: name.to_string(),
        })
        .await
    }

    pub async fn list_capabilities(&mut self) -> Result<ListCapabilitiesResponse> {
        self.request(&WorkerCommand::ListCapabilities).await
    }

    pub async fn export_state(&mut self) -> Result<SessionSnapshot> {
        self.request(&WorkerCommand::ExportState).await
    }

    pub async fn import_state(&mut self, state: SessionSnapshot) -> Result<ImportReport> {
        self.request(&WorkerCommand::ImportState { state }).await
    }

    /// Cooperative shutdown: send the kill signal, then wait briefly so the
    /// child is reaped rather than leaked.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!("worker kill failed (already exited?): {err}");
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
    }
}
