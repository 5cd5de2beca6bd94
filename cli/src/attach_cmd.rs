//! The attach client: one request per invocation, one JSON line back.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use capstan_protocol::AttachOp;
use capstan_protocol::AttachRequest;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixStream;

#[derive(Debug, clap::Subcommand)]
pub enum AttachCommand {
    /// Check the host is up and whether the session is busy.
    Ping,
    /// Execute code in the session.
    Execute { code: String },
    /// Summarize the session.
    State,
    /// List registered capabilities.
    ListCapabilities,
    /// Show one capability's documentation.
    DescribeCapability { name: String },
    /// Dump the session's full exportable state.
    ExportState,
    /// Import a previously exported state from a JSON file.
    ImportState { file: PathBuf },
}

pub struct AttachOpts {
    pub socket: PathBuf,
    pub wait: bool,
    pub timeout: Option<f64>,
    pub command: AttachCommand,
}

fn build_request(opts: &AttachOpts) -> Result<AttachRequest> {
    let mut request = match &opts.command {
        AttachCommand::Ping => AttachRequest::bare(AttachOp::Ping),
        AttachCommand::Execute { code } => {
            let mut request = AttachRequest::bare(AttachOp::Execute);
            request.code = Some(code.clone());
            request
        }
        AttachCommand::State => AttachRequest::bare(AttachOp::State),
        AttachCommand::ListCapabilities => AttachRequest::bare(AttachOp::ListCapabilities),
        AttachCommand::DescribeCapability { name } => {
            let mut request = AttachRequest::bare(AttachOp::DescribeCapability);
            request.name = Some(name.clone());
            request
        }
        AttachCommand::ExportState => AttachRequest::bare(AttachOp::ExportState),
        AttachCommand::ImportState { file } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let mut request = AttachRequest::bare(AttachOp::ImportState);
            request.state = Some(serde_json::from_str(&text)?);
            request
        }
    };
    request.wait = opts.wait;
    request.timeout = opts.timeout;
    Ok(request)
}

pub async fn run_attach(opts: AttachOpts) -> Result<()> {
    let request = build_request(&opts)?;

    let stream = UnixStream::connect(&opts.socket)
        .await
        .with_context(|| format!("cannot connect to {}", opts.socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_string(&request)?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;
    write_half.flush().await?;

    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    if line.trim().is_empty() {
        bail!("host closed the connection without responding");
    }

    // One JSON line out, exactly as the server sent it.
    println!("{}", line.trim());
    Ok(())
}
