//! The capstan session worker.
//!
//! A long-lived child process hosting a persistent interpreter session. It
//! reads one JSON command per line from stdin and writes one JSON response
//! per line to stdout; during `execute`, relay traffic for capability
//! calls is interleaved on the same streams. Diagnostics go to stderr so
//! the protocol streams stay clean.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod builtins;
pub mod interp;
pub mod relay;
pub mod session;

use std::io;

use capstan_protocol::WorkerCommand;
use serde_json::json;
use tracing::debug;

use crate::relay::StdioWire;
use crate::relay::Wire;
use crate::session::Session;

/// The worker's protocol loop: runs until stdin reaches EOF.
pub fn run_main() -> io::Result<()> {
    let mut wire = StdioWire::new();
    let mut session = Session::new();

    while let Some(line) = wire.recv_line()? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerCommand>(trimmed) {
            Ok(command) => session.dispatch(command, &mut wire),
            Err(err) => {
                debug!("rejecting malformed command line: {err}");
                json!({"error": format!("invalid request: {err}")})
            }
        };
        let payload = serde_json::to_string(&response).map_err(io::Error::other)?;
        wire.send_line(&payload)?;
    }

    debug!("stdin reached EOF, worker exiting");
    Ok(())
}
