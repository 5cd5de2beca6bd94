use std::io::Result as IoResult;

fn main() -> IoResult<()> {
    // Stdout belongs to the protocol; tracing output goes to stderr and is
    // controlled with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    capstan_worker::run_main()
}
