//! Logging Setup
//!
//! Installs a `tracing` fmt subscriber filtered by `RUST_LOG`.

use crate::error::{GatewayError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging, falling back to `default_directive` when `RUST_LOG` is unset.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_filter(filter))
        .try_init()
        .map_err(|e| GatewayError::Internal(format!("Failed to initialize tracing: {}", e)))
}

/// Route logs to the test harness; safe to call from every test
pub fn init_test_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
