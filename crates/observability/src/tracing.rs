//! Subscriber initialization.
//!
//! Both entry points read `RUST_LOG`; repository and store spans are emitted
//! at `debug`, so `RUST_LOG=repokit_infra=debug` shows every store call.

use tracing_subscriber::EnvFilter;

/// JSON logs + timestamps for long-running processes.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Compact output routed through the test harness so it is only shown for
/// failing tests.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_test_writer()
        .try_init();
}
