//! The relay hub: a registry of backend tool servers keyed by short names.
//!
//! The hub owns each backend's lifecycle. All mutations happen while the
//! runtime mutex is held, so a plain map suffices; calls only need shared
//! access.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capstan_protocol::ToolSpec;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::backend::BackendClient;
use crate::backend::BackendSpawnSpec;
use crate::error::CapstanErr;
use crate::error::Result;

/// Bound on the install-time `initialize` handshake.
pub const INSTALL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the install-time `tools/list` request.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on one `tools/call` round-trip.
const CALL_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

struct BackendRecord {
    spawn: BackendSpawnSpec,
    tools: BTreeMap<String, ToolSpec>,
    client: Arc<BackendClient>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub command: String,
    pub tools: Vec<String>,
}

#[derive(Default)]
pub struct RelayHub {
    backends: HashMap<String, BackendRecord>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a backend, perform the initialize + list-tools handshake, and
    /// register it under `name`, replacing any existing entry.
    pub async fn install(
        &mut self,
        name: &str,
        spawn: BackendSpawnSpec,
    ) -> Result<BTreeMap<String, ToolSpec>> {
        if self.backends.contains_key(name) {
            self.uninstall(name).await;
        }

        let client = Arc::new(BackendClient::spawn(&spawn).await?);
        let initialized = match client.initialize(INSTALL_HANDSHAKE_TIMEOUT).await {
            Ok(initialized) => initialized,
            Err(err) => {
                client.shutdown().await;
                return Err(err);
            }
        };
        let listed = match client.list_tools(LIST_TOOLS_TIMEOUT).await {
            Ok(listed) => listed,
            Err(err) => {
                client.shutdown().await;
                return Err(err);
            }
        };

        let tools: BTreeMap<String, ToolSpec> = listed
            .tools
            .into_iter()
            .map(|tool| {
                (
                    tool.name,
                    ToolSpec {
                        description: tool.description,
                        parameters: tool.input_schema,
                    },
                )
            })
            .collect();

        info!(
            backend = name,
            server = initialized.server_info.name,
            tools = tools.len(),
            "installed backend"
        );

        self.backends.insert(
            name.to_string(),
            BackendRecord {
                spawn,
                tools: tools.clone(),
                client,
            },
        );
        Ok(tools)
    }

    /// Route `(capability, method, arguments)` to the owning backend. The
    /// conventional payload of a tool result is its first text block; when
    /// the backend returns none, the whole result is passed through.
    pub async fn call(
        &self,
        capability: &str,
        method: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let record = self
            .backends
            .get(capability)
            .ok_or_else(|| CapstanErr::UnknownBackend(capability.to_string()))?;
        if !record.tools.contains_key(method) {
            let available = record.tools.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(CapstanErr::UnknownTool {
                backend: capability.to_string(),
                tool: method.to_string(),
                available,
            });
        }

        let args = if arguments.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(arguments))
        };
        let result = record
            .client
            .call_tool(method, args, CALL_TOOL_TIMEOUT)
            .await?;
        if result.is_error.unwrap_or(false) {
            let detail = result
                .first_text()
                .unwrap_or("tool reported an error")
                .to_string();
            return Err(CapstanErr::Backend(format!(
                "{capability}.{method} failed: {detail}"
            )));
        }
        match result.first_text() {
            Some(text) => Ok(serde_json::Value::String(text.to_string())),
            None => Ok(serde_json::to_value(result)?),
        }
    }

    /// Best-effort shutdown and removal. Returns whether the backend was
    /// present.
    pub async fn uninstall(&mut self, name: &str) -> bool {
        match self.backends.remove(name) {
            Some(record) => {
                record.client.shutdown().await;
                info!(backend = name, "uninstalled backend");
                true
            }
            None => false,
        }
    }

    pub fn tools(&self, name: &str) -> Option<&BTreeMap<String, ToolSpec>> {
        self.backends.get(name).map(|record| &record.tools)
    }

    pub fn command_for(&self, name: &str) -> Option<String> {
        self.backends
            .get(name)
            .map(|record| record.spawn.command_line())
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self
            .backends
            .iter()
            .map(|(name, record)| BackendInfo {
                name: name.clone(),
                command: record.spawn.command_line(),
                tools: record.tools.keys().cloned().collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Uninstall every backend.
    pub async fn close(&mut self) {
        let names: Vec<String> = self.backends.keys().cloned().collect();
        for name in names {
            if !self.uninstall(&name).await {
                warn!(backend = %name, "backend vanished during close");
            }
        }
    }
}
