use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use capstan_cli::attach_cmd;
use capstan_cli::attach_cmd::AttachCommand;
use capstan_cli::serve;

/// Capstan: a capability-mediated code execution harness.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct MultitoolCli {
    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Run the host: the tool endpoint on stdio plus the attach socket.
    #[clap(visible_alias = "s")]
    Serve(ServeArgs),

    /// Send one request to a running host over its attach socket.
    #[clap(visible_alias = "a")]
    Attach(AttachArgs),

    /// Internal: run the session-worker protocol loop on stdio.
    #[clap(hide = true)]
    Worker,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Attach socket path.
    #[arg(long, default_value = ".capstan/attach.sock")]
    socket: PathBuf,

    /// Backend-install configuration (TOML) applied at startup.
    #[arg(long)]
    backends: Option<PathBuf>,

    /// Directory for saved session states.
    #[arg(long, default_value = ".capstan/state")]
    state_dir: PathBuf,
}

#[derive(Debug, Parser)]
struct AttachArgs {
    /// Attach socket path.
    #[arg(long, default_value = ".capstan/attach.sock")]
    socket: PathBuf,

    /// Wait for the session instead of failing fast when it is busy.
    #[arg(long, default_value_t = false)]
    wait: bool,

    /// Give up after this many seconds when waiting.
    #[arg(long)]
    timeout: Option<f64>,

    #[clap(subcommand)]
    command: AttachCommand,
}

fn main() -> Result<()> {
    let cli = MultitoolCli::parse();

    match cli.subcommand {
        Subcommand::Worker => {
            // Stdout belongs to the worker protocol; logs go to stderr.
            init_tracing();
            capstan_worker::run_main()?;
            Ok(())
        }
        Subcommand::Serve(args) => {
            init_tracing();
            tokio_runtime()?.block_on(serve::run_serve(serve::ServeOpts {
                socket: args.socket,
                backends: args.backends,
                state_dir: args.state_dir,
            }))
        }
        Subcommand::Attach(args) => tokio_runtime()?.block_on(attach_cmd::run_attach(
            attach_cmd::AttachOpts {
                socket: args.socket,
                wait: args.wait,
                timeout: args.timeout,
                command: args.command,
            },
        )),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn tokio_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
