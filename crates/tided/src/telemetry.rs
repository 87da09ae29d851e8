//! Logging initialization for the Tidepool daemon.

use tracing_subscriber::EnvFilter;

/// Install the console subscriber.
///
/// `RUST_LOG` takes precedence over the configured `level`. Call this once at
/// startup, before any `tracing` events are emitted.
pub fn init_console(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
