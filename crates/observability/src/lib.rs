//! Process-wide tracing setup for the PDP worker and its tests.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    crate::tracing::init(&TracingConfig::default());
}

/// Initialize human-readable logging captured by the test harness.
pub fn init_for_tests() {
    crate::tracing::init(&TracingConfig::for_tests());
}
