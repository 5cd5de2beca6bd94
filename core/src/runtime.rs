//! The host runtime: one worker, one hub, one state store, one fair mutex.
//!
//! Every user-facing operation acquires the runtime mutex; the holder has
//! the exclusive right to talk to the worker and to mutate the hub. The
//! mutex stays held across an entire `execute`, relay round-trips included,
//! so exactly one worker command is outstanding at any instant.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capstan_protocol::CapabilityKind;
use capstan_protocol::ExecuteResponse;
use capstan_protocol::ImportReport;
use capstan_protocol::ListCapabilitiesResponse;
use capstan_protocol::RestoreFailure;
use capstan_protocol::SessionSnapshot;
use capstan_protocol::StateResponse;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::info;
use tracing::warn;

use crate::backend::BackendSpawnSpec;
use crate::error::CapstanErr;
use crate::error::Result;
use crate::hub::BackendInfo;
use crate::hub::RelayHub;
use crate::state_store::StateStore;
use crate::worker::WorkerHandle;
use crate::worker::WorkerSpawnSpec;

/// How an attach client wants to compete for the runtime mutex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquisition {
    NonBlocking,
    Blocking,
    Timed(Duration),
}

struct Inner {
    worker: WorkerHandle,
    hub: RelayHub,
}

pub struct Runtime {
    inner: Mutex<Inner>,
    store: StateStore,
    spawn_spec: WorkerSpawnSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveSummary {
    pub path: PathBuf,
    pub functions: usize,
    pub variables: usize,
    pub capabilities: usize,
    pub history_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreSummary {
    #[serde(flatten)]
    pub report: ImportReport,
    pub relay_reconnected: Vec<String>,
    pub relay_failed: Vec<RestoreFailure>,
}

impl Runtime {
    /// Spawn the worker and assemble the runtime. The worker-spawn spec is
    /// kept for `reset`, which replaces the worker rather than restarting
    /// it in place.
    pub async fn start(spawn_spec: WorkerSpawnSpec, store: StateStore) -> Result<Arc<Self>> {
        let worker = WorkerHandle::spawn(&spawn_spec).await?;
        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                worker,
                hub: RelayHub::new(),
            }),
            store,
            spawn_spec,
        }))
    }

    /// Whether a command is currently holding the mutex.
    pub fn busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub async fn lock(&self) -> RuntimeGuard<'_> {
        RuntimeGuard {
            runtime: self,
            inner: self.inner.lock().await,
        }
    }

    /// Acquire under an attach client's chosen discipline; `None` means
    /// "busy".
    pub async fn acquire(&self, acquisition: Acquisition) -> Option<RuntimeGuard<'_>> {
        let inner = match acquisition {
            Acquisition::NonBlocking => self.inner.try_lock().ok()?,
            Acquisition::Blocking => self.inner.lock().await,
            Acquisition::Timed(limit) => {
                tokio::time::timeout(limit, self.inner.lock()).await.ok()?
            }
        };
        Some(RuntimeGuard {
            runtime: self,
            inner,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Saved-state names; does not touch the worker, so no lock.
    pub fn list_saved_states(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn delete_state(&self, name: &str) -> Result<bool> {
        self.store.delete(name)
    }

    pub async fn execute(&self, code: &str) -> Result<ExecuteResponse> {
        self.lock().await.execute(code).await
    }

    pub async fn state(&self) -> Result<StateResponse> {
        self.lock().await.state().await
    }

    pub async fn list_capabilities(&self) -> Result<ListCapabilitiesResponse> {
        self.lock().await.list_capabilities().await
    }

    pub async fn register_capability(&self, name: &str) -> Result<Option<String>> {
        self.lock().await.register_capability(name).await
    }

    pub async fn describe_capability(&self, name: &str) -> Result<String> {
        self.lock().await.describe_capability(name).await
    }

    pub async fn install_capability(
        &self,
        name: &str,
        spawn: BackendSpawnSpec,
    ) -> Result<Vec<String>> {
        self.lock().await.install_capability(name, spawn).await
    }

    pub async fn uninstall_capability(&self, name: &str) -> bool {
        self.lock().await.uninstall_capability(name).await
    }

    pub async fn list_backends(&self) -> Vec<BackendInfo> {
        self.lock().await.list_backends()
    }

    pub async fn save_state(&self, name: &str) -> Result<SaveSummary> {
        self.lock().await.save_state(name).await
    }

    pub async fn restore_state(&self, name: &str) -> Result<RestoreSummary> {
        self.lock().await.restore_state(name).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.lock().await.reset().await
    }

    pub async fn shutdown(&self) {
        self.lock().await.shutdown().await;
    }
}

pub struct RuntimeGuard<'a> {
    runtime: &'a Runtime,
    inner: MutexGuard<'a, Inner>,
}

impl RuntimeGuard<'_> {
    pub async fn execute(&mut self, code: &str) -> Result<ExecuteResponse> {
        let Inner { worker, hub } = &mut *self.inner;
        let hub = &*hub;
        worker
            .execute(code, move |capability, method, arguments| async move {
                hub.call(&capability, &method, arguments)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
    }

    pub async fn state(&mut self) -> Result<StateResponse> {
        self.inner.worker.state().await
    }

    pub async fn list_capabilities(&mut self) -> Result<ListCapabilitiesResponse> {
        self.inner.worker.list_capabilities().await
    }

    pub async fn register_capability(&mut self, name: &str) -> Result<Option<String>> {
        let response = self.inner.worker.register_capability(name).await?;
        Ok(if response.success {
            response.capability_name
        } else {
            None
        })
    }

    /// Render a capability's documentation by executing `<name>.describe()`
    /// inside the session.
    pub async fn describe_capability(&mut self, name: &str) -> Result<String> {
        if !is_identifier(name) {
            return Err(CapstanErr::CapabilityNotFound(name.to_string()));
        }
        let code = format!("{name}.describe()");
        let result = self.execute(&code).await?;
        match (result.success, result.return_value) {
            (true, Some(serde_json::Value::String(text))) => Ok(text),
            (true, Some(other)) => Ok(other.to_string()),
            _ => Err(CapstanErr::CapabilityNotFound(name.to_string())),
        }
    }

    /// Install a backend and inject its typed tool table as a relay
    /// capability. A failed injection rolls the install back.
    pub async fn install_capability(
        &mut self,
        name: &str,
        spawn: BackendSpawnSpec,
    ) -> Result<Vec<String>> {
        let Inner { worker, hub } = &mut *self.inner;
        let tools = hub.install(name, spawn).await?;
        let ack = worker.inject_relay_capability(name, tools.clone()).await?;
        if !ack.success {
            hub.uninstall(name).await;
            return Err(CapstanErr::Protocol(format!(
                "worker refused relay capability '{name}': {}",
                ack.error.unwrap_or_default()
            )));
        }
        Ok(tools.into_keys().collect())
    }

    /// Tear the backend down. The relay object remains in the session and
    /// will raise if called.
    pub async fn uninstall_capability(&mut self, name: &str) -> bool {
        self.inner.hub.uninstall(name).await
    }

    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.inner.hub.list()
    }

    pub async fn export_state(&mut self) -> Result<SessionSnapshot> {
        let Inner { worker, hub } = &mut *self.inner;
        let mut snapshot = worker.export_state().await?;
        // The worker knows relay capabilities only by name; the hub holds
        // the spawn commands needed to reconnect them later.
        for capability in &mut snapshot.capabilities {
            if capability.kind == CapabilityKind::Relay {
                capability.command = hub.command_for(&capability.name);
            }
        }
        Ok(snapshot)
    }

    pub async fn import_state(&mut self, state: SessionSnapshot) -> Result<RestoreSummary> {
        let report = self.inner.worker.import_state(state.clone()).await?;
        self.reconnect_relays(&state, report).await
    }

    pub async fn save_state(&mut self, name: &str) -> Result<SaveSummary> {
        let snapshot = self.export_state().await?;
        let summary = SaveSummary {
            path: PathBuf::new(),
            functions: snapshot.functions.len(),
            variables: snapshot.variables.len(),
            capabilities: snapshot.capabilities.len(),
            history_length: snapshot.history.len(),
        };
        let path = self.runtime.store.save(name, snapshot)?;
        Ok(SaveSummary { path, ..summary })
    }

    pub async fn restore_state(&mut self, name: &str) -> Result<RestoreSummary> {
        let snapshot = self
            .runtime
            .store
            .load(name)?
            .ok_or_else(|| CapstanErr::StateNotFound(name.to_string()))?;
        let report = self.inner.worker.import_state(snapshot.clone()).await?;
        self.reconnect_relays(&snapshot, report).await
    }

    async fn reconnect_relays(
        &mut self,
        snapshot: &SessionSnapshot,
        report: ImportReport,
    ) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary {
            report,
            ..Default::default()
        };
        let to_restore = summary.report.relay_capabilities_to_restore.clone();
        for name in to_restore {
            let command = snapshot
                .capabilities
                .iter()
                .find(|cap| cap.kind == CapabilityKind::Relay && cap.name == name)
                .and_then(|cap| cap.command.clone());
            let Some(command) = command else {
                summary.relay_failed.push(RestoreFailure {
                    name,
                    error: "no recorded spawn command".to_string(),
                });
                continue;
            };
            let result = async {
                let spawn = BackendSpawnSpec::parse(&command)?;
                self.install_capability(&name, spawn).await
            }
            .await;
            match result {
                Ok(_) => summary.relay_reconnected.push(name),
                Err(err) => {
                    warn!(capability = %name, "relay reconnect failed: {err}");
                    summary.relay_failed.push(RestoreFailure {
                        name,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Replace the worker with a fresh one and drop every backend. State is
    /// neither persisted nor restored; save first if it matters.
    pub async fn reset(&mut self) -> Result<()> {
        info!("resetting session");
        self.inner.hub.close().await;
        self.inner.worker.shutdown().await;
        self.inner.worker = WorkerHandle::spawn(&self.runtime.spawn_spec).await?;
        Ok(())
    }

    /// Cooperative shutdown: close the hub (uninstalling each backend),
    /// then terminate the worker. Both children are reaped.
    pub async fn shutdown(&mut self) {
        self.inner.hub.close().await;
        self.inner.worker.shutdown().await;
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_check_refuses_injection() {
        assert!(is_identifier("math"));
        assert!(is_identifier("_private"));
        assert!(!is_identifier("1bad"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("x; rm"));
        assert!(!is_identifier(""));
    }
}
