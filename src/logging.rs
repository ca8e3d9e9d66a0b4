//! Tracing setup for binaries and demos.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding service's call.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call more than once; later calls are ignored.
///
/// # Example
/// ```bash
/// RUST_LOG=protrial=debug cargo run --example trial_lifecycle
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
