//! Process-level observability setup.
//!
//! The library itself only emits `tracing` events; wiring a subscriber is
//! the embedder's job. These helpers give binaries and examples a one-call
//! setup with the crate's conventions.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a formatted subscriber honoring `RUST_LOG`, defaulting to
/// errors only. Safe to call once per process.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("error,flowboard=error"))
        .unwrap_or_else(|_| EnvFilter::new("error"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Install miette's pretty panic reports.
pub fn init_miette() {
    miette::set_panic_hook();
}
