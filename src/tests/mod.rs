mod chain_sync_test;
mod genesis_allocation_test;
mod shutdown_test;
mod sink_semantics_test;

use std::time::Duration;

use etherfeed_sync::SyncConfig;

/// A config tuned for fast test turnaround.
pub fn test_config(exit_at: Option<u64>) -> SyncConfig {
    SyncConfig {
        exit_at,
        poll_interval: Duration::from_millis(20),
        node_retry_base: Duration::from_millis(10),
        node_retry_cap: Duration::from_millis(100),
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
