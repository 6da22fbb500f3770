//! Diagnostic tracing for lifecycle commands.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Command results
//! (step logs, outcomes, the pause marker) are printed to stdout by the CLI.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `dc=info,warn`.
///
/// # Example
/// ```bash
/// RUST_LOG=dc=debug dc directive start --session 26-01-15_vendor-table
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dc=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
