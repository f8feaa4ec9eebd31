use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for a hosting process.
///
/// Filter comes from `RUST_LOG` when set, otherwise `info`. Call once at
/// startup; library crates only emit events and never install subscribers.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
