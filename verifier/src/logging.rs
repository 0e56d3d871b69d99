//! Tracing setup for the verifier binaries.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. The dataset
//! itself (`<output>/*.jsonl`, `summary.json`) is unaffected by log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when unset.
///
/// ```bash
/// RUST_LOG=verifier=debug verifier run --output out acme/widgets
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
