//! Process-wide tracing setup.
//!
//! Mirrors how the host binary wires logging today: an `EnvFilter`-driven
//! subscriber writing to stderr, so that a caller piping stdout as a clean
//! protocol channel (telephony signalling, JSON control messages, etc.) never
//! sees log lines mixed in.

/// Install the global `tracing` subscriber.
///
/// Respects `RUST_LOG` if set, otherwise defaults to `info`. Safe to call at
/// most once per process; a second call is a no-op (the error from
/// `tracing_subscriber::util::TryInitError` is swallowed since it only
/// indicates a subscriber is already installed, which callers running under
/// `#[tokio::test]` harnesses trigger routinely).
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
