//! Development-time tracing.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted.
//! - **Activity sinks (`io/activity`)**: product output on stdout and in
//!   `.taskloop/activity/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`. Compact format on stderr.
///
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run --tasks tasks.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
