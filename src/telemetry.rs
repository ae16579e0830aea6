//! Tracing initialization.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the embedding application's choice. `init` wires up the standard fmt
//! layer filtered by `RUST_LOG`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Initialize the default tracing subscriber.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .try_init();
}
