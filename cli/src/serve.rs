//! The `capstan serve` loop.
//!
//! The host speaks the tool-server convention on its own stdio (so a
//! coding agent can drive the session through tool calls) while the attach
//! socket serves interactive clients concurrently. Both front-ends share
//! one runtime and therefore one mutex.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use capstan_core::attach::AttachServer;
use capstan_core::backend_config::load_backend_config;
use capstan_core::runtime::Runtime;
use capstan_core::state_store::StateStore;
use capstan_core::worker::WorkerSpawnSpec;
use capstan_protocol::JsonRpcMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::processor::MessageProcessor;

/// Bounded channels between the stdio tasks; plenty for an interactive
/// front-end.
const CHANNEL_CAPACITY: usize = 128;

pub struct ServeOpts {
    pub socket: PathBuf,
    pub backends: Option<PathBuf>,
    pub state_dir: PathBuf,
}

pub async fn run_serve(opts: ServeOpts) -> Result<()> {
    let store = StateStore::new(&opts.state_dir)?;
    let spawn = WorkerSpawnSpec::current_exe()?;
    let runtime = Runtime::start(spawn, store)
        .await
        .context("failed to start the session worker")?;

    if let Some(path) = &opts.backends {
        install_from_config(&runtime, path).await;
    }

    let attach = AttachServer::bind(&opts.socket, Arc::clone(&runtime))?;
    let attach_task = tokio::spawn(async move {
        if let Err(err) = attach.run().await {
            error!("attach endpoint failed: {err}");
        }
    });

    run_tool_endpoint(Arc::clone(&runtime)).await?;

    // Stdin EOF: the agent went away. Tear everything down.
    attach_task.abort();
    runtime.shutdown().await;
    Ok(())
}

/// Install every enabled backend from the config file; failures are logged
/// and skipped rather than fatal.
async fn install_from_config(runtime: &Runtime, path: &Path) {
    let specs = match load_backend_config(path) {
        Ok(specs) => specs,
        Err(err) => {
            warn!(path = %path.display(), "could not load backend config: {err}");
            return;
        }
    };
    for (name, spec) in specs {
        match runtime.install_capability(&name, spec.clone()).await {
            Ok(tools) => info!(
                backend = %name,
                command = %spec.command_line(),
                tools = tools.len(),
                "installed backend from config"
            ),
            Err(err) => warn!(backend = %name, "failed to install backend: {err}"),
        }
    }
}

/// The tool endpoint: a reader task feeding a processor, and a writer task
/// draining outgoing messages to stdout.
async fn run_tool_endpoint(runtime: Arc<Runtime>) -> Result<()> {
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if stdout.write_all(json.as_bytes()).await.is_err()
                        || stdout.write_all(b"\n").await.is_err()
                        || stdout.flush().await.is_err()
                    {
                        error!("failed writing to stdout, stopping");
                        break;
                    }
                }
                Err(err) => error!("failed to serialize outgoing message: {err}"),
            }
        }
        debug!("stdout writer exited");
    });

    let mut processor = MessageProcessor::new(outgoing_tx, runtime);
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(message) => processor.process(message).await,
            Err(err) => error!("failed to parse incoming message: {err}"),
        }
    }
    debug!("stdin reached EOF");

    drop(processor);
    let _ = writer.await;
    Ok(())
}
