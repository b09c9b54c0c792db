//! Tracing setup for binaries and tests embedding the engine.
//!
//! The library itself only emits `tracing` events; installing a
//! subscriber is the embedder's choice. This helper wires the standard
//! stack (env-filter + fmt) for the common case.

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the default subscriber: `RUST_LOG`-style filtering, compact
/// output. Safe to call once per process; later calls are no-ops.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn,sqlbeam=info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
