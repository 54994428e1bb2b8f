//! Structured test logging.
//!
//! Tests call [`init_test_logging`] first; it installs a JSON subscriber that
//! writes through the test harness so output only shows for failing tests.
//! Safe to call from every test.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Install the shared test subscriber once per process.
///
/// The filter honours `DDH_TEST_LOG_LEVEL`, then `RUST_LOG`, then `debug`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = std::env::var("DDH_TEST_LOG_LEVEL")
            .ok()
            .and_then(|level| EnvFilter::try_new(level).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new("debug"));

        // Another harness may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .try_init();
    });
}
