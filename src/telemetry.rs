//! Tracing initialization for applications and tests.
//!
//! The library only emits `tracing` events; it never installs a
//! subscriber on its own. Consumers that don't already have one can call
//! `init()` for an env-filtered fmt subscriber, or attach their own
//! layers (OTLP exporters, test capture) instead.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

/// Install an env-filtered fmt subscriber (RUST_LOG, default "info").
///
/// # Errors
///
/// Returns an error if a global subscriber was already set.
pub fn init() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))
}

/// Same as [`init`], but quietly a no-op when a subscriber already exists.
/// Intended for tests, where init order is unpredictable.
pub fn init_for_tests() {
    let _ = init();
}
