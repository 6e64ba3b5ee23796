use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr so the report on stdout stays exact.
/// Verbosity follows `RUST_LOG` and defaults to warnings only.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
