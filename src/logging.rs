//! # Structured Logging Module
//!
//! Environment-aware tracing initialization for worker processes. Hosts that
//! install their own subscriber can skip this entirely; initialization is
//! idempotent either way.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with an `RUST_LOG`-style filter.
///
/// Defaults to `info` for this crate when no filter is set. Safe to call
/// more than once; later calls are no-ops.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("taskhub_core=info"));

        let result = tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_level(true))
            .with(filter)
            .try_init();

        // A host-installed subscriber already being active is fine.
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed, reusing it");
        }
    });
}
