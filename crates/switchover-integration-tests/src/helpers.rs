//! Test helpers and utilities

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchover_cluster=debug,switchover_sync=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout_duration {
        if condition().await {
            return Ok(());
        }
        sleep(poll_interval).await;
    }

    anyhow::bail!("Condition not met within {:?}", timeout_duration)
}

/// Wait for a condition with default timeout (30s) and poll interval (100ms)
pub async fn wait_for_condition<F, Fut>(condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for(
        condition,
        Duration::from_secs(30),
        Duration::from_millis(100),
    )
    .await
}
