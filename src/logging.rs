//! Subscriber setup for test drivers
//!
//! The library only emits `tracing` events; binaries and test suites decide
//! where they go. `RUST_LOG` controls the filter (default `info`).

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::info!("subscriber installed");
    }
}
