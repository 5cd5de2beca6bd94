//! Attach endpoint: a local stream socket for interactive clients.
//!
//! Clients submit one JSON request per line and receive one JSON line back.
//! Each request is dispatched under the runtime mutex with the acquisition
//! mode the client asked for: fail-fast, blocking, or timed.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use capstan_protocol::AttachOp;
use capstan_protocol::AttachRequest;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::runtime::Acquisition;
use crate::runtime::Runtime;

pub struct AttachServer {
    listener: UnixListener,
    socket_path: PathBuf,
    runtime: Arc<Runtime>,
}

impl AttachServer {
    /// Bind the socket, replacing any stale file from a previous run.
    pub fn bind(socket_path: &Path, runtime: Arc<Runtime>) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "attach endpoint listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            runtime,
        })
    }

    /// Accept loop; one task per connection.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let runtime = Arc::clone(&self.runtime);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, runtime).await {
                    debug!("attach connection ended: {err}");
                }
            });
        }
    }
}

impl Drop for AttachServer {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            debug!("failed to unlink attach socket: {err}");
        }
    }
}

async fn handle_connection(stream: UnixStream, runtime: Arc<Runtime>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AttachRequest>(&line) {
            Ok(request) => dispatch(&runtime, request).await,
            Err(err) => {
                warn!("invalid attach request: {err}");
                json!({"success": false, "error": format!("invalid request: {err}")})
            }
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
        write_half.flush().await?;
    }
    Ok(())
}

fn acquisition_for(request: &AttachRequest) -> Acquisition {
    if !request.wait {
        Acquisition::NonBlocking
    } else {
        match request.timeout {
            Some(seconds) => Acquisition::Timed(Duration::from_secs_f64(seconds.max(0.0))),
            None => Acquisition::Blocking,
        }
    }
}

pub async fn dispatch(runtime: &Runtime, request: AttachRequest) -> serde_json::Value {
    if request.op == AttachOp::Ping {
        return json!({"success": true, "busy": runtime.busy()});
    }

    let acquisition = acquisition_for(&request);
    let Some(mut guard) = runtime.acquire(acquisition).await else {
        debug!(op = ?request.op, "rejecting attach request: busy");
        return json!({"success": false, "error": "session busy"});
    };

    let result = match request.op {
        AttachOp::Ping => unreachable!("handled above"),
        AttachOp::Execute => {
            let code = request.code.unwrap_or_default();
            guard
                .execute(&code)
                .await
                .and_then(|result| Ok(serde_json::to_value(result)?))
        }
        AttachOp::State => guard
            .state()
            .await
            .and_then(|state| Ok(serde_json::to_value(state)?)),
        AttachOp::ListCapabilities => guard.list_capabilities().await.and_then(|listing| {
            Ok(json!({"success": true, "capabilities": listing.capabilities}))
        }),
        AttachOp::DescribeCapability => {
            let name = request.name.unwrap_or_default();
            guard
                .describe_capability(&name)
                .await
                .map(|description| json!({"success": true, "description": description}))
        }
        AttachOp::ExportState => guard
            .export_state()
            .await
            .and_then(|state| Ok(json!({"success": true, "state": state}))),
        AttachOp::ImportState => match request.state {
            Some(state) => guard
                .import_state(state)
                .await
                .and_then(|summary| Ok(json!({"success": true, "result": summary}))),
            None => Ok(json!({"success": false, "error": "missing state"})),
        },
    };

    match result {
        Ok(value) => value,
        Err(err) => json!({"success": false, "error": err.to_string()}),
    }
}
