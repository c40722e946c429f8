//! Common test utilities for service catalog integration tests

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

/// Upper bound for eventually-consistent assertions
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a tracing subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "service_catalog=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] passes
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        smol::Timer::after(Duration::from_millis(20)).await;
    }
    false
}
