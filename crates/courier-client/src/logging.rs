use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,courier_client=debug,courier_net=debug";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
